//! Human-readable rendering of messages.
//!
//! Used for diagnostics in hop logs. Fields are numbered by their position after the segment
//! tag:
//!
//! ```text
//! Segment: MSH
//!   Field 1: ^~\&
//!   Field 2: HIS
//!
//! Segment: PID
//!   Field 1: 1
//! ```

use crate::Message;

/// Renders every segment and field of `message` on its own line.
pub fn to_plain_text(message: &Message) -> String {
    let mut out = String::new();
    for segment in message.segments() {
        out.push_str(&format!("Segment: {}\n", segment.kind()));
        for (i, field) in segment.fields().iter().enumerate() {
            out.push_str(&format!("  Field {}: {}\n", i + 1, field));
        }
        out.push('\n');
    }
    out
}
