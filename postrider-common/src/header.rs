//! Ordered message-header model.
//!
//! The pipeline treats the header section as a list of fields whose
//! order matters: trace and result fields are prepended, and DKIM-style
//! signers care about exact ordering. Parsing goes through `mailparse`;
//! serialization writes plain `Name: value` lines.

use thiserror::Error;

/// A single header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name, case preserved.
    pub name: String,
    /// Field body, without the trailing CRLF.
    pub value: String,
}

impl Field {
    /// Creates a header field.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Error produced when a header section fails to parse.
#[derive(Debug, Error)]
#[error("malformed header section: {0}")]
pub struct HeaderParseError(String);

/// An ordered header section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<Field>,
}

impl Header {
    /// Creates an empty header section.
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Parses a raw header section (everything before the empty line).
    ///
    /// # Errors
    ///
    /// Returns [`HeaderParseError`] when the bytes are not a valid
    /// header section.
    pub fn parse(raw: &[u8]) -> Result<Self, HeaderParseError> {
        let (parsed, _) =
            mailparse::parse_headers(raw).map_err(|e| HeaderParseError(e.to_string()))?;
        let fields = parsed
            .iter()
            .map(|h| Field::new(h.get_key(), h.get_value()))
            .collect();
        Ok(Self { fields })
    }

    /// Inserts a field at the top of the section.
    pub fn prepend(&mut self, field: Field) {
        self.fields.insert(0, field);
    }

    /// Appends a field at the bottom of the section.
    pub fn append(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// The first field with the given name, case-insensitively.
    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }

    /// All values of fields with the given name, top to bottom.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }

    /// Number of fields with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.get_all(name).count()
    }

    /// All fields in order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Total number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the section has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serializes the section, including the blank separator line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for field in &self.fields {
            out.extend_from_slice(field.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(field.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_and_lookup() {
        let raw = b"From: a@example.com\r\nSubject: hi\r\nReceived: one\r\nReceived: two\r\n\r\n";
        let header = Header::parse(raw).unwrap();
        assert_eq!(header.len(), 4);
        assert_eq!(header.get_first("from"), Some("a@example.com"));
        assert_eq!(header.get_first("subject"), Some("hi"));
        assert_eq!(header.count("Received"), 2);
        assert_eq!(
            header.get_all("received").collect::<Vec<_>>(),
            vec!["one", "two"]
        );
    }

    #[test]
    fn test_prepend_keeps_order() {
        let mut header = Header::new();
        header.append(Field::new("Subject", "hi"));
        header.prepend(Field::new("Received", "trace"));
        header.prepend(Field::new("Authentication-Results", "host; none"));
        let names: Vec<_> = header.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Authentication-Results", "Received", "Subject"]);
    }

    #[test]
    fn test_serialization() {
        let mut header = Header::new();
        header.append(Field::new("From", "a@example.com"));
        header.append(Field::new("Subject", "hi"));
        assert_eq!(
            header.to_bytes(),
            b"From: a@example.com\r\nSubject: hi\r\n\r\n".to_vec()
        );
    }
}
