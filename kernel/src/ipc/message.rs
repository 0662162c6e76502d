//! IPC message types

use crate::types::{Endpoint, ProcNr};

/// Number of 64-bit payload words in a message.
pub const MESS_WORDS: usize = 7;

/// `m_type` bit marking a kernel-synthesized notification.
pub const NOTIFY_MESSAGE: i32 = 0x1000;

/// `m_type` of a notification from `src`.
#[inline]
pub const fn notify_from(src: ProcNr) -> i32 {
    NOTIFY_MESSAGE | src.as_raw() as i32
}

/// Fixed-size message, copied by value between address spaces.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    /// Sender identity, stamped by the kernel on every copy
    pub source: Endpoint,
    /// Message type. For REPLY, the endpoint of the caller being answered.
    pub m_type: i32,
    /// Payload words
    pub payload: [u64; MESS_WORDS],
}

impl Default for Message {
    fn default() -> Self {
        Self {
            source: Endpoint::NONE,
            m_type: 0,
            payload: [0; MESS_WORDS],
        }
    }
}

impl Message {
    /// Create a message with the given type and leading payload words
    pub fn new(m_type: i32, words: &[u64]) -> Self {
        let mut msg = Self {
            m_type,
            ..Self::default()
        };
        let len = words.len().min(MESS_WORDS);
        msg.payload[..len].copy_from_slice(&words[..len]);
        msg
    }

    /// Create a REPLY message addressed to `caller`
    pub fn reply(caller: Endpoint, words: &[u64]) -> Self {
        Self::new(caller.as_raw(), words)
    }

    /// Endpoint a REPLY message answers.
    #[inline]
    pub fn reply_to(&self) -> Endpoint {
        Endpoint::from_raw(self.m_type)
    }

    /// Badge supplied by a NOTIFY caller.
    #[inline]
    pub fn badge(&self) -> u64 {
        self.payload[0]
    }

    /// Returns a copy carrying `source` as its sender.
    #[inline]
    pub fn stamped(mut self, source: Endpoint) -> Self {
        self.source = source;
        self
    }

    #[inline]
    pub fn is_notification(&self) -> bool {
        self.m_type & NOTIFY_MESSAGE != 0 && self.m_type & !0x1fff == 0
    }

    /// Decodes the notification fields, if this is a notification.
    pub fn as_notification(&self) -> Option<NotifyPayload> {
        self.is_notification().then(|| NotifyPayload {
            timestamp: self.payload[0],
            badge: self.payload[1],
            interrupts: self.payload[2] as u32,
            sigset: self.payload[3],
        })
    }
}

/// Body of a kernel-synthesized notification message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Uptime at delivery
    pub timestamp: u64,
    /// Caller-supplied badge; zero when the notification was deferred
    pub badge: u64,
    /// Pending interrupts, for notifications from HARDWARE
    pub interrupts: u32,
    /// Pending signals, for notifications from SYSTEM
    pub sigset: u64,
}

impl NotifyPayload {
    /// Builds the message delivered to the receiver of a notification.
    pub fn into_message(self, src: ProcNr, src_ep: Endpoint) -> Message {
        let mut msg = Message::new(
            notify_from(src),
            &[self.timestamp, self.badge, self.interrupts as u64, self.sigset],
        );
        msg.source = src_ep;
        msg
    }
}
