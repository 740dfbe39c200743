//! Validated primitives shared by the relay crates.
//!
//! Types in this crate guarantee their invariant once constructed, so callers further down the
//! pipeline never need to re-check them.

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,

    /// The input is not usable as a single path component
    #[error("Invalid artifact name: {0}")]
    InvalidArtifactName(String),
}

/// A string type that guarantees non-empty content.
///
/// This type wraps a `String` and ensures it contains at least one non-whitespace character.
/// The input is automatically trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// The input is trimmed of leading and trailing whitespace. If the trimmed
    /// result is empty, an error is returned.
    ///
    /// # Arguments
    ///
    /// * `input` - Any type that can be converted to a string reference
    ///
    /// # Returns
    ///
    /// Returns `Ok(NonEmptyText)` if the trimmed input is non-empty,
    /// or `Err(TextError::Empty)` if it's empty or contains only whitespace.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

/// The file name of a unit of work inside a pipeline folder.
///
/// An artifact name is exactly one path component: it is non-empty, contains no path
/// separators, and is neither `.` nor `..`. Names are carried over from the source artifact and
/// are not otherwise structured.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactName(String);

impl ArtifactName {
    /// Validates `input` as a single path component.
    ///
    /// # Errors
    ///
    /// Returns `TextError::Empty` for blank input and `TextError::InvalidArtifactName` when the
    /// name could escape its folder.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let name = input.as_ref();
        if name.trim().is_empty() {
            return Err(TextError::Empty);
        }
        if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(TextError::InvalidArtifactName(name.to_owned()));
        }
        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the extension (text after the final `.`), if any.
    pub fn extension(&self) -> Option<&str> {
        self.0
            .rsplit_once('.')
            .filter(|(stem, _)| !stem.is_empty())
            .map(|(_, ext)| ext)
    }
}

impl std::fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ArtifactName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty_text_trims() {
        let text = NonEmptyText::new("  localhost ").unwrap();
        assert_eq!(text.as_str(), "localhost");
        assert_eq!(NonEmptyText::new("   "), Err(TextError::Empty));
    }

    #[test]
    fn test_non_empty_text_serde_rejects_blank() {
        let ok: NonEmptyText = serde_json::from_str("\"relay\"").unwrap();
        assert_eq!(ok.as_str(), "relay");
        assert!(serde_json::from_str::<NonEmptyText>("\" \"").is_err());
    }

    #[test]
    fn test_artifact_name_rejects_traversal() {
        assert!(ArtifactName::new("patient.json").is_ok());
        assert!(matches!(
            ArtifactName::new("../patient.json"),
            Err(TextError::InvalidArtifactName(_))
        ));
        assert!(matches!(
            ArtifactName::new(".."),
            Err(TextError::InvalidArtifactName(_))
        ));
        assert_eq!(ArtifactName::new(""), Err(TextError::Empty));
    }

    #[test]
    fn test_artifact_name_extension() {
        assert_eq!(
            ArtifactName::new("adt_a01.hl7").unwrap().extension(),
            Some("hl7")
        );
        assert_eq!(ArtifactName::new("README").unwrap().extension(), None);
        assert_eq!(ArtifactName::new(".hidden").unwrap().extension(), None);
    }
}
