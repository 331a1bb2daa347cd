// Mirror node common library - main library exports

pub mod hash;
pub mod ledger;
pub mod messages;
pub mod record_file;
pub mod stream;

// Flattened re-exports
pub use self::hash::{Hash, Sha384Hash};
pub use self::ledger::{Ledger, NodeContribution};
pub use self::record_file::RecordFile;
pub use self::stream::{BlockSourceType, StreamType};
