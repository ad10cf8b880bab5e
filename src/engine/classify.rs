//! Intent and sentiment classification pass

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ChatMessage, GenerationRequest};

/// What the user is trying to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Saludo,
    Consulta,
    Pedido,
    Queja,
    Soporte,
    Despedida,
}

impl Intent {
    pub const ALL: [Self; 6] = [
        Self::Saludo,
        Self::Consulta,
        Self::Pedido,
        Self::Queja,
        Self::Soporte,
        Self::Despedida,
    ];

    /// Label stored on messages
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Saludo => "saludo",
            Self::Consulta => "consulta",
            Self::Pedido => "pedido",
            Self::Queja => "queja",
            Self::Soporte => "soporte",
            Self::Despedida => "despedida",
        }
    }

    fn parse(label: &str) -> Option<Self> {
        let label = label.trim().to_lowercase();
        Self::ALL.into_iter().find(|i| i.as_str() == label)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emotional tone of the user's message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    /// Label stored on conversations
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }

    fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "positive" | "positivo" => Some(Self::Positive),
            "neutral" => Some(Self::Neutral),
            "negative" | "negativo" => Some(Self::Negative),
            _ => None,
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the classification pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub intent: Intent,
    pub sentiment: Sentiment,
    pub entities: Vec<String>,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            intent: Intent::Consulta,
            sentiment: Sentiment::Neutral,
            entities: Vec::new(),
        }
    }
}

const CLASSIFIER_PROMPT: &str = "Clasifica el mensaje del cliente. Responde solo con JSON en \
la forma {\"intent\": \"...\", \"sentiment\": \"...\", \"entities\": [\"...\"]}. \
intent es uno de: saludo, consulta, pedido, queja, soporte, despedida. \
sentiment es uno de: positive, neutral, negative. \
entities lista productos, fechas, cantidades o lugares mencionados.";

/// Build the low-temperature classification request
#[must_use]
pub fn classification_request(text: &str, model: &str) -> GenerationRequest {
    GenerationRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::system(CLASSIFIER_PROMPT), ChatMessage::user(text)],
        temperature: 0.0,
        max_tokens: 150,
    }
}

#[derive(Deserialize)]
struct RawClassification {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    sentiment: Option<String>,
    #[serde(default)]
    entities: Vec<serde_json::Value>,
}

/// Parse classifier output, defaulting anything unreadable
///
/// Tolerates prose or code fences around the JSON object.
#[must_use]
pub fn parse_classification(raw: &str) -> Classification {
    let defaults = Classification::default();

    let json = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => {
            tracing::debug!(raw, "classifier returned no JSON object");
            return defaults;
        }
    };

    let Ok(parsed) = serde_json::from_str::<RawClassification>(json) else {
        tracing::debug!(raw, "classifier JSON did not parse");
        return defaults;
    };

    Classification {
        intent: parsed
            .intent
            .as_deref()
            .and_then(Intent::parse)
            .unwrap_or(defaults.intent),
        sentiment: parsed
            .sentiment
            .as_deref()
            .and_then(Sentiment::parse)
            .unwrap_or(defaults.sentiment),
        entities: parsed
            .entities
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let c = parse_classification(
            r#"{"intent": "pedido", "sentiment": "positive", "entities": ["pizza", 2]}"#,
        );
        assert_eq!(c.intent, Intent::Pedido);
        assert_eq!(c.sentiment, Sentiment::Positive);
        assert_eq!(c.entities, ["pizza", "2"]);
    }

    #[test]
    fn test_parse_fenced_json() {
        let c = parse_classification("```json\n{\"intent\": \"Queja\", \"sentiment\": \"negativo\"}\n```");
        assert_eq!(c.intent, Intent::Queja);
        assert_eq!(c.sentiment, Sentiment::Negative);
        assert!(c.entities.is_empty());
    }

    #[test]
    fn test_unreadable_output_defaults() {
        assert_eq!(parse_classification("no sé"), Classification::default());
        assert_eq!(parse_classification("{intent: pedido"), Classification::default());

        let c = parse_classification(r#"{"intent": "compra", "sentiment": "furioso"}"#);
        assert_eq!(c.intent, Intent::Consulta);
        assert_eq!(c.sentiment, Sentiment::Neutral);
    }

    #[test]
    fn test_request_is_low_temperature() {
        let req = classification_request("hola", "gpt-4o-mini");
        assert!(req.temperature < 0.2);
        assert_eq!(req.messages.len(), 2);
    }
}
