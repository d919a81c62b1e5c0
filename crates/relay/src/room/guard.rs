// Validated apply path for a room's document.
//
// Every binary frame that could mutate the document goes through
// `guarded_apply`: structural checks first, then snapshot, apply, and
// rollback (or reset) when the apply fails.

use decksync_common::crdt::{DocumentError, Replica};
use decksync_common::protocol::frame::validate_document_frame;
use decksync_common::protocol::FrameError;

#[derive(Debug)]
pub enum GuardOutcome {
    /// Applied; the original frame may be forwarded to peers.
    Applied,
    /// Refused before touching the document; resync the sender.
    Rejected(FrameError),
    /// Apply failed and the pre-update state was restored; resync the sender.
    RolledBack(DocumentError),
    /// Restore failed too. The document is now empty and every member must
    /// be resynced.
    Reset { apply_error: DocumentError, restore_error: DocumentError },
}

impl GuardOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

pub fn guarded_apply<R: Replica>(replica: &mut R, frame: &[u8]) -> GuardOutcome {
    let update = match validate_document_frame(frame) {
        Ok(update) => update,
        Err(error) => return GuardOutcome::Rejected(error),
    };

    let snapshot = replica.encode_full();
    let Err(apply_error) = replica.apply_update(update) else {
        return GuardOutcome::Applied;
    };

    match replica.restore_from(&snapshot) {
        Ok(()) => GuardOutcome::RolledBack(apply_error),
        Err(restore_error) => {
            replica.reset_empty();
            GuardOutcome::Reset { apply_error, restore_error }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use decksync_common::crdt::DeckDocument;
    use decksync_common::protocol::frame::{encode_sync_step2, encode_update};
    use serde_json::json;

    /// Applies updates for real, then reports failure, leaving the document
    /// changed the way a half-finished apply would.
    struct FlakyDoc {
        inner: DeckDocument,
        fail_apply: bool,
        fail_restore: bool,
    }

    impl FlakyDoc {
        fn new(fail_apply: bool, fail_restore: bool) -> Self {
            let inner = DeckDocument::with_client_id(1);
            inner.add_element("page-1", "E0", json!({ "x": 0 }).as_object().unwrap()).unwrap();
            Self { inner, fail_apply, fail_restore }
        }
    }

    impl Replica for FlakyDoc {
        fn encode_full(&self) -> Vec<u8> {
            self.inner.encode_full()
        }

        fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
            self.inner.apply_update(update)?;
            if self.fail_apply {
                return Err(DocumentError::Apply("simulated failure".into()));
            }
            Ok(())
        }

        fn restore_from(&mut self, snapshot: &[u8]) -> Result<(), DocumentError> {
            if self.fail_restore {
                return Err(DocumentError::Apply("snapshot unreadable".into()));
            }
            self.inner.restore_from(snapshot)
        }

        fn reset_empty(&mut self) {
            self.inner.reset_empty();
        }
    }

    fn remote_update() -> Vec<u8> {
        let peer = DeckDocument::with_client_id(2);
        peer.add_element("page-1", "E1", json!({ "x": 5 }).as_object().unwrap()).unwrap()
    }

    #[test]
    fn valid_update_is_applied() {
        let mut doc = DeckDocument::with_client_id(1);
        let outcome = guarded_apply(&mut doc, &encode_update(&remote_update()));
        assert!(outcome.is_applied());
        assert!(doc.flatten().element("E1").is_some());

        let outcome = guarded_apply(&mut doc, &encode_sync_step2(&remote_update()));
        assert!(outcome.is_applied());
    }

    #[test]
    fn two_byte_frame_never_reaches_apply() {
        let mut doc = FlakyDoc::new(true, true);
        let before = doc.encode_full();
        let outcome = guarded_apply(&mut doc, &[0, 2]);
        assert!(matches!(outcome, GuardOutcome::Rejected(FrameError::TooShort { len: 2 })));
        assert_eq!(doc.encode_full(), before);
    }

    #[test]
    fn contaminated_frame_is_rejected() {
        let mut doc = DeckDocument::new();
        let outcome = guarded_apply(&mut doc, br#"{"type":"cursor","clientId":"c1"}"#);
        assert!(matches!(outcome, GuardOutcome::Rejected(FrameError::TextContamination)));
    }

    #[test]
    fn failed_apply_restores_exact_prior_state() {
        let mut doc = FlakyDoc::new(true, false);
        let before = doc.encode_full();

        let outcome = guarded_apply(&mut doc, &encode_update(&remote_update()));

        assert!(matches!(outcome, GuardOutcome::RolledBack(_)));
        assert_eq!(doc.encode_full(), before);
        assert!(doc.inner.flatten().element("E1").is_none());
    }

    #[test]
    fn failed_restore_resets_to_empty() {
        let mut doc = FlakyDoc::new(true, true);

        let outcome = guarded_apply(&mut doc, &encode_update(&remote_update()));

        assert!(matches!(outcome, GuardOutcome::Reset { .. }));
        assert_eq!(doc.inner.element_count(), 0);
        assert_eq!(doc.inner.flatten().pages.len(), 0);
    }
}
