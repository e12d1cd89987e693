use std::fmt::Display;

/// Builds every key the pipeline touches under one namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_owned(),
        }
    }

    fn key(&self, parts: &[&dyn Display]) -> String {
        parts.iter().fold(self.prefix.clone(), |mut key, part| {
            key.push(':');
            key.push_str(&part.to_string());
            key
        })
    }

    /// The event log stream.
    pub fn checkins(&self) -> String {
        self.key(&[&"checkins"])
    }

    /// The dedup filter bitmap.
    pub fn checkin_filter(&self) -> String {
        self.key(&[&"checkinfilter"])
    }

    pub fn user(&self, user_id: u64) -> String {
        self.key(&[&"users", &user_id])
    }

    pub fn location(&self, location_id: u64) -> String {
        self.key(&[&"locations", &location_id])
    }

    /// Last id consumed by the single-reader processor.
    pub fn checkpoint(&self) -> String {
        self.key(&[&"checkinprocessor", &"lastid"])
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("ncc")
    }
}
