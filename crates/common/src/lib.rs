// decksync-common: shared types, document model and wire format for the decksync workspace

pub mod crdt;
pub mod protocol;
pub mod types;
