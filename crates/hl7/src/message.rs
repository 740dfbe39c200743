//! Immutable HL7v2 message model.
//!
//! A [`Message`] is an ordered list of [`Segment`]s plus the [`Encoding`] declared by its own
//! MSH segment. Fields are stored exactly as they appear on the wire (no unescaping), which is
//! what makes `parse(serialise(m)) == m` hold for every message this module produces.

use crate::{
    AckError, Hl7Error, Hl7Result, StructuralError, MIN_MSH_TOKENS, MIN_SEGMENTS,
    SEGMENT_DELIMITER,
};
use std::fmt;
use std::str::FromStr;

/// Separator characters declared by MSH-1 and MSH-2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding {
    field: char,
    component: char,
    repetition: char,
    escape: char,
    subcomponent: char,
}

impl Default for Encoding {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl Encoding {
    /// Builds the encoding from the MSH field separator and the MSH-2 encoding characters.
    ///
    /// Missing trailing characters fall back to the standard `^~\&`. An empty MSH-2 yields the
    /// standard set with the given field separator.
    ///
    /// # Errors
    ///
    /// Returns `Hl7Error::InvalidEncoding` if a declared character repeats another separator.
    pub fn from_msh(field: char, characters: &str) -> Hl7Result<Self> {
        let defaults = Self::default();
        let mut declared = characters.chars();
        let encoding = Self {
            field,
            component: declared.next().unwrap_or(defaults.component),
            repetition: declared.next().unwrap_or(defaults.repetition),
            escape: declared.next().unwrap_or(defaults.escape),
            subcomponent: declared.next().unwrap_or(defaults.subcomponent),
        };

        let all = [
            encoding.field,
            encoding.component,
            encoding.repetition,
            encoding.escape,
            encoding.subcomponent,
        ];
        for (i, c) in all.iter().enumerate() {
            if all[i + 1..].contains(c) {
                return Err(Hl7Error::InvalidEncoding(characters.to_owned()));
            }
        }

        Ok(encoding)
    }

    pub fn field_separator(&self) -> char {
        self.field
    }

    pub fn component_separator(&self) -> char {
        self.component
    }

    /// The MSH-2 form of this encoding, e.g. `^~\&`.
    pub fn characters(&self) -> String {
        [self.component, self.repetition, self.escape, self.subcomponent]
            .iter()
            .collect()
    }

    /// Escapes separator characters in free text so it can be carried in a single field.
    pub fn escape_text(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            let code = if c == self.escape {
                Some('E')
            } else if c == self.field {
                Some('F')
            } else if c == self.component {
                Some('S')
            } else if c == self.repetition {
                Some('R')
            } else if c == self.subcomponent {
                Some('T')
            } else {
                None
            };
            match code {
                Some(code) => {
                    out.push(self.escape);
                    out.push(code);
                    out.push(self.escape);
                }
                None if c == '\r' || c == '\n' => out.push(' '),
                None => out.push(c),
            }
        }
        out
    }
}

/// One typed record within a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub(crate) kind: String,
    pub(crate) fields: Vec<String>,
}

impl Segment {
    /// Creates a segment from its type code and the fields following the tag.
    ///
    /// For an MSH segment the first entry of `fields` is MSH-2 (the encoding characters); use
    /// [`Segment::msh`] to have those filled in from an [`Encoding`].
    ///
    /// # Errors
    ///
    /// Returns `Hl7Error::InvalidSegment` unless `kind` is three uppercase ASCII letters or digits,
    /// and `Hl7Error::DelimiterInField` when a field contains a segment delimiter.
    pub fn new(kind: impl Into<String>, fields: Vec<String>) -> Hl7Result<Self> {
        let kind = kind.into();
        if !is_segment_kind(&kind) {
            return Err(Hl7Error::InvalidSegment(kind));
        }
        let segment = Self { kind, fields };
        segment.check_fields(&['\r', '\n'])?;
        Ok(segment)
    }

    /// Creates an MSH segment whose fields start at MSH-3.
    pub fn msh(encoding: &Encoding, fields_from_msh3: Vec<String>) -> Self {
        let mut fields = Vec::with_capacity(fields_from_msh3.len() + 1);
        fields.push(encoding.characters());
        fields.extend(fields_from_msh3);
        Self {
            kind: "MSH".into(),
            fields,
        }
    }

    fn parse(line: &str, separator: char) -> Hl7Result<Self> {
        let mut tokens = line.split(separator);
        let kind = tokens.next().unwrap_or_default();
        if !is_segment_kind(kind) {
            return Err(Hl7Error::InvalidSegment(line.chars().take(32).collect()));
        }
        Ok(Self {
            kind: kind.to_owned(),
            fields: tokens.map(str::to_owned).collect(),
        })
    }

    /// The 3-character segment type code.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Fields following the segment tag, in wire order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Number of separator-delimited tokens on the wire, the segment tag included.
    pub fn token_count(&self) -> usize {
        self.fields.len() + 1
    }

    /// Returns field `n` using HL7 numbering.
    ///
    /// For MSH, field 1 is the field separator itself and is not stored, so `field(1)` returns
    /// `None` and `field(2)` is the encoding characters. For every other segment field 1 is the
    /// first token after the tag.
    pub fn field(&self, n: usize) -> Option<&str> {
        let index = if self.kind == "MSH" {
            n.checked_sub(2)?
        } else {
            n.checked_sub(1)?
        };
        self.fields.get(index).map(String::as_str)
    }

    fn check_fields(&self, delimiters: &[char]) -> Hl7Result<()> {
        match self
            .fields
            .iter()
            .position(|field| field.contains(delimiters))
        {
            Some(i) => Err(Hl7Error::DelimiterInField {
                segment: self.kind.clone(),
                index: if self.kind == "MSH" { i + 2 } else { i + 1 },
                value: self.fields[i].clone(),
            }),
            None => Ok(()),
        }
    }

    fn write_to(&self, separator: char, out: &mut String) {
        out.push_str(&self.kind);
        for field in &self.fields {
            out.push(separator);
            out.push_str(field);
        }
    }
}

/// The message type/trigger-event pair carried in MSH-9, e.g. `ADT^A01`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageType {
    pub code: String,
    pub trigger: Option<String>,
}

impl MessageType {
    fn parse(value: &str, component: char) -> Self {
        let mut parts = value.split(component);
        let code = parts.next().unwrap_or_default().to_owned();
        let trigger = parts
            .next()
            .filter(|t| !t.is_empty())
            .map(str::to_owned);
        Self { code, trigger }
    }

    /// True when both the message code and the trigger event match.
    pub fn is(&self, code: &str, trigger: &str) -> bool {
        self.code == code && self.trigger.as_deref() == Some(trigger)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.trigger {
            Some(trigger) => write!(f, "{}^{}", self.code, trigger),
            None => write!(f, "{}", self.code),
        }
    }
}

/// An immutable HL7v2 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub(crate) encoding: Encoding,
    pub(crate) segments: Vec<Segment>,
}

impl Message {
    /// Assembles a message from already-built segments.
    ///
    /// The result always serialises to text that parses back to an equal message: `encoding` must
    /// be the one the first segment declares (the standard set when it is not an MSH), and no field
    /// may contain the field separator or a segment delimiter.
    ///
    /// # Errors
    ///
    /// Returns `Hl7Error::Empty` when `segments` is empty, `Hl7Error::InvalidEncoding` when
    /// `encoding` disagrees with the MSH segment, and `Hl7Error::DelimiterInField` for a field
    /// that would split on the wire.
    pub fn new(encoding: Encoding, segments: Vec<Segment>) -> Hl7Result<Self> {
        let first = segments.first().ok_or(Hl7Error::Empty)?;
        let declared = if first.kind() == "MSH" {
            let characters = first
                .field(2)
                .ok_or_else(|| Hl7Error::InvalidEncoding(String::new()))?;
            Encoding::from_msh(encoding.field, characters)?
        } else {
            Encoding::default()
        };
        if declared != encoding {
            return Err(Hl7Error::InvalidEncoding(encoding.characters()));
        }

        let delimiters = [encoding.field, '\r', '\n'];
        for segment in &segments {
            segment.check_fields(&delimiters)?;
        }
        Ok(Self { encoding, segments })
    }

    /// Parses the wire form of a message.
    ///
    /// Accepts `\r`, `\n` and `\r\n` as segment delimiters and ignores blank lines and leading
    /// whitespace. Whitespace inside the last segment is kept. The field
    /// separator is read from the MSH segment when the message starts with one, otherwise `|`
    /// is assumed. No structural rules are applied here; see [`Message::validate`].
    ///
    /// # Errors
    ///
    /// Returns `Hl7Error::Empty` for blank input, `Hl7Error::InvalidSegment` when a line has no
    /// valid segment tag, and `Hl7Error::InvalidEncoding` for contradictory MSH-2 characters.
    pub fn parse(raw: &str) -> Hl7Result<Self> {
        let lines = split_segments(raw);
        let first = lines.first().ok_or(Hl7Error::Empty)?;
        let separator = detect_field_separator(first);

        let segments = lines
            .iter()
            .map(|line| Segment::parse(line, separator))
            .collect::<Hl7Result<Vec<_>>>()?;

        let encoding = if segments[0].kind() == "MSH" {
            Encoding::from_msh(separator, segments[0].field(2).unwrap_or_default())?
        } else {
            Encoding::default()
        };

        Ok(Self { encoding, segments })
    }

    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The first segment when it is an MSH.
    pub fn msh(&self) -> Option<&Segment> {
        self.segments.first().filter(|s| s.kind() == "MSH")
    }

    /// First segment of the given type.
    pub fn segment(&self, kind: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.kind() == kind)
    }

    /// MSH-9 split into message code and trigger event.
    pub fn message_type(&self) -> Option<MessageType> {
        self.msh()
            .and_then(|msh| msh.field(9))
            .filter(|v| !v.is_empty())
            .map(|v| MessageType::parse(v, self.encoding.component))
    }

    /// MSH-10, the sender-assigned message control id.
    pub fn control_id(&self) -> Option<&str> {
        self.msh().and_then(|msh| msh.field(10))
    }

    /// Like [`Message::control_id`] but reports a missing id as an acknowledgment error.
    pub(crate) fn require_control_id(&self) -> Result<&str, AckError> {
        let msh = self.msh().ok_or(AckError::MissingMsh)?;
        msh.field(10).ok_or(AckError::MissingControlId)
    }

    /// Applies the structural checks of [`crate::validate`] to an already-parsed message.
    pub fn validate(&self) -> Result<(), StructuralError> {
        if self.segments.len() < MIN_SEGMENTS {
            return Err(StructuralError::NotEnoughSegments);
        }
        let msh = self.msh().ok_or(StructuralError::MissingMsh)?;
        if msh.token_count() < MIN_MSH_TOKENS {
            return Err(StructuralError::MshTooShort);
        }
        Ok(())
    }
}

impl fmt::Display for Message {
    /// Renders the wire form: segments joined by `\r`, no trailing delimiter.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                out.push(SEGMENT_DELIMITER);
            }
            segment.write_to(self.encoding.field, &mut out);
        }
        f.write_str(&out)
    }
}

impl FromStr for Message {
    type Err = Hl7Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Splits raw text into non-blank segment lines.
pub(crate) fn split_segments(raw: &str) -> Vec<&str> {
    raw.trim_start()
        .split(['\r', '\n'])
        .filter(|line| !line.trim().is_empty())
        .collect()
}

/// Field separator declared by an MSH line (its fourth character), `|` otherwise.
pub(crate) fn detect_field_separator(first_line: &str) -> char {
    first_line
        .strip_prefix("MSH")
        .and_then(|rest| rest.chars().next())
        .unwrap_or('|')
}

fn is_segment_kind(kind: &str) -> bool {
    kind.len() == 3
        && kind
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}
