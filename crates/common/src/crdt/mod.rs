pub mod document;

pub use document::{
    is_empty_update, DeckDocument, DeckView, DocumentError, ElementFields, PageView, Replica,
    EMPTY_UPDATE_LEN,
};
