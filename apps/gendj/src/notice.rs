//! User-facing notices, decoupled from any particular front end. Transient
//! notices are de-duplicated so a flapping connection raises one warning, not
//! a stack of them; a fatal notice corresponds to the blocking alert path.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    ConnectionTrouble,
    Moderation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Transient { kind: TransientKind, text: String },
    Dismissed(TransientKind),
    Fatal(String),
}

pub struct NoticeCenter {
    tx: mpsc::UnboundedSender<Notice>,
    live_transient: Mutex<Option<TransientKind>>,
}

impl NoticeCenter {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                live_transient: Mutex::new(None),
            }),
            rx,
        )
    }

    /// Raise the "having trouble connecting" warning. No-op while one is
    /// already live.
    pub fn connection_trouble(&self) {
        self.raise_transient(
            TransientKind::ConnectionTrouble,
            "Having trouble connecting...".to_string(),
        );
    }

    /// Raise the content-moderation warning, replacing whatever transient
    /// notice is currently live.
    pub fn moderation_warning(&self) {
        {
            let mut live = self.live_transient.lock();
            if let Some(kind) = live.take() {
                let _ = self.tx.send(Notice::Dismissed(kind));
            }
        }
        self.raise_transient(
            TransientKind::Moderation,
            "Explicit or copyrighted content is not permitted".to_string(),
        );
    }

    /// Dismiss the live transient notice of the given kind, if any.
    pub fn dismiss(&self, kind: TransientKind) {
        let mut live = self.live_transient.lock();
        if *live == Some(kind) {
            *live = None;
            let _ = self.tx.send(Notice::Dismissed(kind));
        }
    }

    /// Unrecoverable failure surfaced to the user before the session dies.
    pub fn fatal(&self, text: impl Into<String>) {
        let _ = self.tx.send(Notice::Fatal(text.into()));
    }

    fn raise_transient(&self, kind: TransientKind, text: String) {
        let mut live = self.live_transient.lock();
        if *live == Some(kind) {
            return;
        }
        *live = Some(kind);
        let _ = self.tx.send(Notice::Transient { kind, text });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_trouble_is_deduplicated() {
        let (center, mut rx) = NoticeCenter::channel();
        center.connection_trouble();
        center.connection_trouble();
        center.connection_trouble();
        assert!(matches!(
            rx.try_recv(),
            Ok(Notice::Transient {
                kind: TransientKind::ConnectionTrouble,
                ..
            })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dismiss_allows_a_fresh_warning() {
        let (center, mut rx) = NoticeCenter::channel();
        center.connection_trouble();
        center.dismiss(TransientKind::ConnectionTrouble);
        center.connection_trouble();
        assert!(matches!(rx.try_recv(), Ok(Notice::Transient { .. })));
        assert!(matches!(
            rx.try_recv(),
            Ok(Notice::Dismissed(TransientKind::ConnectionTrouble))
        ));
        assert!(matches!(rx.try_recv(), Ok(Notice::Transient { .. })));
    }

    #[test]
    fn moderation_replaces_live_transient() {
        let (center, mut rx) = NoticeCenter::channel();
        center.connection_trouble();
        center.moderation_warning();
        assert!(matches!(rx.try_recv(), Ok(Notice::Transient { .. })));
        assert!(matches!(
            rx.try_recv(),
            Ok(Notice::Dismissed(TransientKind::ConnectionTrouble))
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(Notice::Transient {
                kind: TransientKind::Moderation,
                ..
            })
        ));
    }

    #[test]
    fn dismiss_of_absent_kind_is_silent() {
        let (center, mut rx) = NoticeCenter::channel();
        center.dismiss(TransientKind::ConnectionTrouble);
        assert!(rx.try_recv().is_err());
    }
}
