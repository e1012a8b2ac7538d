//! The record encryption filter and its supporting wire formats:
//! `EncryptionScheme`, `Parcel`, `RecordWrapper`, and the topic→KEK
//! selector.

pub mod filter;
pub mod parcel;
pub mod scheme;
pub mod selector;
pub mod wrapper;

pub use filter::RecordEncryptionFilter;
pub use parcel::Parcel;
pub use scheme::{EncryptionScheme, RecordField};
pub use selector::{KekSelector, TopicNameKekSelector};
pub use wrapper::RecordWrapper;
