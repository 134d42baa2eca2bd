//! Message-port handles and the outbound delivery seam.

/// Opaque handle identifying the destination mailbox for deliveries.
pub type Port = u64;

/// Deliveries addressed to this port are silently dropped.
pub const ILLEGAL_PORT: Port = 0;

/// Outbound delivery primitive.
///
/// The loop thread is the only caller; implementations must be cheap and must
/// not block, since every call happens between two `kevent` suspensions.
pub trait PortSink: Send + Sync {
    /// Delivers a 32-bit value (the bit pattern of an
    /// [`EventBits`](crate::events::EventBits) mask) to `port`.
    fn post_int32(&self, port: Port, value: i32);

    /// Delivers a null message to `port`. Used for timer expirations.
    fn post_null(&self, port: Port);
}
