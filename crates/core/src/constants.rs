//! Constants used throughout the relay core crate.

use std::time::Duration;

/// Default directory for pipeline folders, records and scratch files.
pub const DEFAULT_DATA_DIR: &str = "relay_data";

/// Default directory holding the mutual TLS bundle.
pub const DEFAULT_CERT_DIR: &str = "keys";

/// Directory name for development records storage, under the data directory.
pub const RECORDS_DIR_NAME: &str = "Records";

/// Extension of FHIR document units.
pub const DOCUMENT_EXTENSION: &str = "json";

/// Extension of HL7 message units.
pub const MESSAGE_EXTENSION: &str = "hl7";

/// Largest serialised record the development store accepts (1 MiB).
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Default interval between folder polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// MSH-3/4 of messages built by the relay.
pub const SENDING_APPLICATION: &str = "HL7_RELAY";
pub const SENDING_FACILITY: &str = "RELAY";

/// MSH-5/6 of messages built by the relay.
pub const RECEIVING_APPLICATION: &str = "ULTRA";
pub const RECEIVING_FACILITY: &str = "ULTRA";

/// Assigning authority written into PID-3.
pub const ASSIGNING_AUTHORITY: &str = "RELAY";
