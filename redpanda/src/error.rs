//! Mapping of Kafka client errors onto relay error types.

use booking_relay_core::event_bus::{BrokerError, PublishError};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};

fn is_auth(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
    )
}

/// Group membership changed under us; the partition may belong to someone else.
fn is_rebalance(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::IllegalGeneration
            | RDKafkaErrorCode::UnknownMemberId
            | RDKafkaErrorCode::RebalanceInProgress
    )
}

/// Map a produce failure. `size` is the encoded record size.
pub(crate) fn publish_error(err: &KafkaError, size: usize, limit: usize) -> PublishError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => PublishError::PayloadTooLarge { size, limit },
        Some(code) if is_auth(code) => PublishError::Auth(err.to_string()),
        _ => PublishError::Connection(err.to_string()),
    }
}

/// Map a consumer-side failure.
pub(crate) fn broker_error(err: &KafkaError) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(code) if is_auth(code) => BrokerError::Unauthorized(err.to_string()),
        Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic) => {
            BrokerError::Configuration(err.to_string())
        },
        _ => BrokerError::Transport(err.to_string()),
    }
}

/// Map a commit or seek failure for one message.
pub(crate) fn settle_error(err: &KafkaError, message_id: &str) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(code) if is_rebalance(code) => BrokerError::LockLost {
            message_id: message_id.to_string(),
        },
        _ => broker_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_record_is_payload_too_large() {
        let err = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        assert_eq!(
            publish_error(&err, 2_000_000, 1_000_000),
            PublishError::PayloadTooLarge {
                size: 2_000_000,
                limit: 1_000_000
            }
        );
    }

    #[test]
    fn auth_failures_are_not_transient() {
        let err = KafkaError::MessageProduction(RDKafkaErrorCode::TopicAuthorizationFailed);
        assert!(matches!(publish_error(&err, 1, 1), PublishError::Auth(_)));

        let err = KafkaError::MessageConsumption(RDKafkaErrorCode::SaslAuthenticationFailed);
        assert!(matches!(broker_error(&err), BrokerError::Unauthorized(_)));
    }

    #[test]
    fn timeouts_are_connection_errors() {
        let err = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert!(publish_error(&err, 1, 1).is_transient());

        let err = KafkaError::MessageConsumption(RDKafkaErrorCode::BrokerTransportFailure);
        assert!(matches!(broker_error(&err), BrokerError::Transport(_)));
    }

    #[test]
    fn rebalance_during_commit_is_lock_lost() {
        let err = KafkaError::ConsumerCommit(RDKafkaErrorCode::RebalanceInProgress);
        assert_eq!(
            settle_error(&err, "bookings-0-4"),
            BrokerError::LockLost {
                message_id: "bookings-0-4".into()
            }
        );
    }

    #[test]
    fn missing_topic_is_configuration() {
        let err = KafkaError::MetadataFetch(RDKafkaErrorCode::UnknownTopicOrPartition);
        assert!(matches!(broker_error(&err), BrokerError::Configuration(_)));
    }
}
