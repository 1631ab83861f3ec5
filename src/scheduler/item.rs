use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One captcha handed out to at most one client at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub url: String,
    pub instruction: String,
    /// Every source field other than id/url/instruction, kept for scoring.
    pub raw_data: Map<String, Value>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, url: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            instruction: instruction.into(),
            raw_data: Map::new(),
        }
    }

    pub fn with_raw_data(mut self, raw_data: Map<String, Value>) -> Self {
        self.raw_data = raw_data;
        self
    }

    /// Build an item from one entry of the source payload.
    ///
    /// Returns `None` when `id` or `url` is missing. A `url` of the form
    /// `<url>@<instruction>` is split when no explicit instruction is given.
    pub fn from_source(entry: &Value) -> Option<Self> {
        let fields = entry.as_object()?;
        let id = match fields.get("id")? {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let raw_url = fields.get("url")?.as_str()?;

        let explicit = fields
            .get("instruction")
            .and_then(Value::as_str)
            .map(str::to_string);
        let (url, instruction) = match (explicit, raw_url.split_once('@')) {
            (Some(instruction), _) => (raw_url.to_string(), instruction),
            (None, Some((url, instruction))) => (url.to_string(), instruction.to_string()),
            (None, None) => (raw_url.to_string(), String::new()),
        };

        let raw_data = fields
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "id" | "url" | "instruction"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Self {
            id,
            url,
            instruction,
            raw_data,
        })
    }

    fn numbered_fields(&self) -> impl Iterator<Item = &Value> {
        self.raw_data
            .iter()
            .filter(|(k, _)| {
                k.parse::<u32>()
                    .is_ok_and(|n| n >= 1 && n.to_string() == k.as_str())
            })
            .map(|(_, v)| v)
    }

    /// Data-volume score used to hand out the lightest item first.
    ///
    /// Sums the entry count of every numbered field: array length or object
    /// key count. Scalars count zero.
    pub fn data_volume(&self) -> usize {
        self.numbered_fields()
            .map(|v| match v {
                Value::Array(entries) => entries.len(),
                Value::Object(keys) => keys.len(),
                _ => 0,
            })
            .sum()
    }

    /// Number of answer steps this item expects, if it declares any.
    pub fn step_count(&self) -> Option<u32> {
        let n = self.numbered_fields().count() as u32;
        (n > 0).then_some(n)
    }
}
