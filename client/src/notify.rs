//! Notification intents.
//!
//! The session never renders anything. It issues [`Notification`]s and the
//! front end decides how to show them.

use std::time::Duration;
use tracing::info;

/// Identifies one notification across create/update/close.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToastId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToastKind {
    Loading,
    Success,
    Error,
}

impl ToastKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToastKind::Loading => "loading",
            ToastKind::Success => "success",
            ToastKind::Error => "error",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Toast {
    pub kind: ToastKind,
    pub message: String,
    /// `None` keeps the toast until it is updated or closed.
    pub duration: Option<Duration>,
    pub closable: bool,
}

impl Toast {
    pub fn loading(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Loading,
            message: message.into(),
            duration: None,
            closable: false,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Success,
            message: message.into(),
            duration: Some(Duration::from_secs(3)),
            closable: true,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Error,
            message: message.into(),
            duration: Some(Duration::from_secs(3)),
            closable: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    Create { id: ToastId, toast: Toast },
    Update { id: ToastId, toast: Toast },
    Close(ToastId),
}

impl Notification {
    pub fn id(&self) -> ToastId {
        match self {
            Notification::Create { id, .. } | Notification::Update { id, .. } => *id,
            Notification::Close(id) => *id,
        }
    }
}

/// Presentation capability implemented by the front end.
pub trait Notifier: Send + 'static {
    fn notify(&mut self, notification: Notification);

    /// Play the win effect.
    fn celebrate(&mut self) {}
}

/// Writes notifications to the log. Used when no front end is attached.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&mut self, notification: Notification) {
        match notification {
            Notification::Create { id, toast } | Notification::Update { id, toast } => {
                info!(
                    id = id.0,
                    kind = toast.kind.as_str(),
                    message = %toast.message,
                    "notification"
                );
            }
            Notification::Close(id) => info!(id = id.0, "notification closed"),
        }
    }

    fn celebrate(&mut self) {
        info!("celebrate");
    }
}
