use std::collections::BTreeMap;

/// Case-insensitive, multi-valued header map. Keys are stored canonicalized
/// to title-case ("Content-Length"), matching
/// `textproto.CanonicalMIMEHeaderKey` in `original_source/proxy/http/utils.go`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn canonicalize(key: &str) -> String {
        key.split('-')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&Self::canonicalize(key))
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.0
            .get(&Self::canonicalize(key))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(Self::canonicalize(key), vec![value.into()]);
    }

    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.0.entry(Self::canonicalize(key)).or_default().push(value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.0.remove(&Self::canonicalize(key));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&Self::canonicalize(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    /// Writes `Key: value\r\n` for every header/value pair, in key order.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (key, values) in &self.0 {
            for value in values {
                out.extend_from_slice(key.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
    }
}
