pub mod cpio;
pub mod events;
pub mod genkeys;
pub mod record;

pub use cpio::{read_archive, write_archive};
pub use events::{parse_and_extend, EventLog, EventType, OsImageIdentity, PcrBank, PcrEvent, MAX_PCRS, MAX_PCR_LOG_EVENTS};
pub use genkeys::{generate as generate_keys, KeyPaths};
pub use record::{create, verify, ExternalSignTool, SignTool, SignatureRecord, RECORD_SIZE};
