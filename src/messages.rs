//! Message composition. Pure and deterministic: template catalog in,
//! channel-ready content out. The catalog is externally suppliable as a
//! serde document; built-in EN/FR/DE defaults cover the shipped trigger
//! types. FR uses formal "vous", DE formal "Sie" throughout; English adds
//! a formal salutation variant when the recipient prefers formal address.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::enums::{Severity, TriggerType};
use crate::models::{ChannelMessage, Recipient};

/// One template entry: subject and body with `{placeholder}` slots.
/// `body_formal` is used for recipients flagged for formal address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub body_formal: Option<String>,
}

/// Values substituted into template placeholders.
#[derive(Debug, Clone, Default)]
pub struct MessageVars {
    pub patient_name: String,
    pub medication_name: Option<String>,
}

/// Catalog of templates keyed by template key, then locale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateCatalog {
    #[serde(default = "default_locale")]
    pub default_locale: String,
    pub templates: HashMap<String, HashMap<String, MessageTemplate>>,
}

fn default_locale() -> String {
    "en".to_string()
}

impl TemplateCatalog {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    fn lookup(&self, key: &str, locale: &str) -> Option<&MessageTemplate> {
        let by_locale = self.templates.get(key)?;
        by_locale
            .get(locale)
            .or_else(|| by_locale.get(&self.default_locale))
    }
}

/// Stateless composer over a template catalog.
pub struct MessageComposer {
    catalog: TemplateCatalog,
}

impl MessageComposer {
    pub fn new(catalog: TemplateCatalog) -> Self {
        Self { catalog }
    }

    /// Compose a message for one recipient. Falls back to the default
    /// locale for unknown locales and to the trigger-type template when
    /// the action's template key has no catalog entry; never fails the
    /// overall dispatch.
    pub fn compose(
        &self,
        recipient: &Recipient,
        trigger_type: TriggerType,
        severity: Severity,
        template_key: &str,
        vars: &MessageVars,
    ) -> ChannelMessage {
        let template = self
            .catalog
            .lookup(template_key, &recipient.locale)
            .or_else(|| self.catalog.lookup(trigger_type.as_str(), &recipient.locale))
            .or_else(|| self.catalog.lookup("default", &recipient.locale));

        let (subject, body) = match template {
            Some(t) => {
                let body = if recipient.formal_address {
                    t.body_formal.as_deref().unwrap_or(&t.body)
                } else {
                    &t.body
                };
                (t.subject.clone(), body.to_string())
            }
            // A catalog with no usable entry at all still must not fail
            // dispatch; emit a minimal English line.
            None => (
                "Medication check needed".to_string(),
                "{recipient}, please check on {patient} right away.".to_string(),
            ),
        };

        let locale = if self.catalog.templates.values().any(|m| m.contains_key(&recipient.locale))
        {
            recipient.locale.clone()
        } else {
            self.catalog.default_locale.clone()
        };

        ChannelMessage {
            subject: render(&subject, recipient, vars),
            body: render(&body, recipient, vars),
            locale,
            severity,
        }
    }
}

impl Default for MessageComposer {
    fn default() -> Self {
        Self::new(builtin_catalog())
    }
}

fn render(template: &str, recipient: &Recipient, vars: &MessageVars) -> String {
    template
        .replace("{recipient}", &recipient.name)
        .replace("{patient}", &vars.patient_name)
        .replace(
            "{medication}",
            vars.medication_name.as_deref().unwrap_or("their medication"),
        )
}

/// Built-in EN/FR/DE templates for the shipped trigger types.
pub fn builtin_catalog() -> TemplateCatalog {
    let mut templates: HashMap<String, HashMap<String, MessageTemplate>> = HashMap::new();

    templates.insert(
        TriggerType::MissedCriticalMedication.as_str().to_string(),
        locales(
            MessageTemplate {
                subject: "{patient} missed a critical medication".into(),
                body: "Hi {recipient}, {patient} has not taken {medication} as scheduled. \
                       Please check on them now and confirm once they are safe."
                    .into(),
                body_formal: Some(
                    "Dear {recipient}, {patient} has not taken {medication} as scheduled. \
                     Please check on them now and confirm once they are safe."
                        .into(),
                ),
            },
            MessageTemplate {
                subject: "{patient} a manqué un médicament critique".into(),
                body: "Bonjour {recipient}, {patient} n'a pas pris {medication} comme prévu. \
                       Veuillez vérifier sa situation maintenant et confirmer qu'il est en sécurité."
                    .into(),
                body_formal: None,
            },
            MessageTemplate {
                subject: "{patient} hat ein kritisches Medikament verpasst".into(),
                body: "Hallo {recipient}, {patient} hat {medication} nicht wie geplant eingenommen. \
                       Bitte sehen Sie jetzt nach und bestätigen Sie, sobald alles in Ordnung ist."
                    .into(),
                body_formal: None,
            },
        ),
    );

    templates.insert(
        TriggerType::OverdueDose.as_str().to_string(),
        locales(
            MessageTemplate {
                subject: "{patient} has overdue doses".into(),
                body: "Hi {recipient}, {patient} has missed several doses of {medication}. \
                       Please reach out to them and confirm."
                    .into(),
                body_formal: Some(
                    "Dear {recipient}, {patient} has missed several doses of {medication}. \
                     Please reach out to them and confirm."
                        .into(),
                ),
            },
            MessageTemplate {
                subject: "{patient} a des prises en retard".into(),
                body: "Bonjour {recipient}, {patient} a manqué plusieurs prises de {medication}. \
                       Veuillez le contacter et confirmer."
                    .into(),
                body_formal: None,
            },
            MessageTemplate {
                subject: "{patient} hat Dosen versäumt".into(),
                body: "Hallo {recipient}, {patient} hat mehrere Dosen von {medication} versäumt. \
                       Bitte nehmen Sie Kontakt auf und bestätigen Sie."
                    .into(),
                body_formal: None,
            },
        ),
    );

    templates.insert(
        TriggerType::ProlongedInactivity.as_str().to_string(),
        locales(
            MessageTemplate {
                subject: "No activity from {patient}".into(),
                body: "Hi {recipient}, {patient} has shown no activity for an extended period. \
                       Please check on them now."
                    .into(),
                body_formal: Some(
                    "Dear {recipient}, {patient} has shown no activity for an extended period. \
                     Please check on them now."
                        .into(),
                ),
            },
            MessageTemplate {
                subject: "Aucune activité de {patient}".into(),
                body: "Bonjour {recipient}, {patient} n'a montré aucune activité depuis un long moment. \
                       Veuillez vérifier sa situation maintenant."
                    .into(),
                body_formal: None,
            },
            MessageTemplate {
                subject: "Keine Aktivität von {patient}".into(),
                body: "Hallo {recipient}, von {patient} gab es längere Zeit keine Aktivität. \
                       Bitte sehen Sie jetzt nach."
                    .into(),
                body_formal: None,
            },
        ),
    );

    templates.insert(
        "default".to_string(),
        locales(
            MessageTemplate {
                subject: "{patient} needs attention".into(),
                body: "Hi {recipient}, {patient} may need help. Please check on them and confirm."
                    .into(),
                body_formal: Some(
                    "Dear {recipient}, {patient} may need help. Please check on them and confirm."
                        .into(),
                ),
            },
            MessageTemplate {
                subject: "{patient} a besoin d'attention".into(),
                body: "Bonjour {recipient}, {patient} pourrait avoir besoin d'aide. \
                       Veuillez vérifier sa situation et confirmer."
                    .into(),
                body_formal: None,
            },
            MessageTemplate {
                subject: "{patient} braucht Aufmerksamkeit".into(),
                body: "Hallo {recipient}, {patient} könnte Hilfe brauchen. \
                       Bitte sehen Sie nach und bestätigen Sie."
                    .into(),
                body_formal: None,
            },
        ),
    );

    TemplateCatalog {
        default_locale: "en".to_string(),
        templates,
    }
}

fn locales(
    en: MessageTemplate,
    fr: MessageTemplate,
    de: MessageTemplate,
) -> HashMap<String, MessageTemplate> {
    let mut map = HashMap::new();
    map.insert("en".to_string(), en);
    map.insert("fr".to_string(), fr);
    map.insert("de".to_string(), de);
    map
}
