use amq_protocol_types::{FieldTable, ShortShortUInt, ShortString};
use lapin::BasicProperties;

/// One outgoing RPC message: payload bytes plus everything the broker needs
/// to route it and everything the remote worker needs to reply.
pub struct CallEnvelope {
    /// The body of the message, already serialized.
    pub payload: Vec<u8>,
    /// The name of the exchange we are publishing the message to.
    pub exchange_name: String,
    /// The routing key the exchange uses to pick the destination queue.
    pub routing_key: String,
    /// AMQP properties attached to the message (correlation id, reply-to,
    /// headers, delivery mode, ...).
    pub properties: BasicProperties,
}

impl CallEnvelope {
    /// A new envelope with persistent delivery mode, the default for RPC
    /// requests.
    pub fn new(payload: Vec<u8>, exchange_name: String, routing_key: String) -> Self {
        Self {
            payload,
            exchange_name,
            routing_key,
            properties: BasicProperties::default().with_delivery_mode(2),
        }
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = f(self.properties);
        self
    }

    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    pub fn with_reply_to(self, value: ShortString) -> Self {
        self.props(|p| p.with_reply_to(value))
    }

    pub fn with_content_type(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_type(value))
    }

    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    pub fn with_delivery_mode(self, value: ShortShortUInt) -> Self {
        self.props(|p| p.with_delivery_mode(value))
    }

    pub fn with_priority(self, value: ShortShortUInt) -> Self {
        self.props(|p| p.with_priority(value))
    }

    /// Per-message TTL, in milliseconds, encoded as the AMQP `expiration`
    /// property.
    pub fn with_expiration(self, value: ShortString) -> Self {
        self.props(|p| p.with_expiration(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_envelopes_are_persistent_by_default() {
        let envelope = CallEnvelope::new(vec![], "rpc".into(), "rpc.order.update_stock".into());
        assert_eq!(envelope.properties.delivery_mode(), &Some(2));
    }

    #[test]
    fn property_setters_accumulate() {
        let envelope = CallEnvelope::new(b"{}".to_vec(), "rpc".into(), "rpc.order.ping".into())
            .with_correlation_id("abc".into())
            .with_reply_to("rpc.reply.xyz".into())
            .with_priority(3);
        let props = &envelope.properties;
        assert_eq!(props.correlation_id().as_ref().map(|s| s.as_str()), Some("abc"));
        assert_eq!(props.reply_to().as_ref().map(|s| s.as_str()), Some("rpc.reply.xyz"));
        assert_eq!(props.priority(), &Some(3));
        assert_eq!(props.delivery_mode(), &Some(2));
    }
}
