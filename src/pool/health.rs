/// Health probing for pooled connections
use crate::core::Connection;
use std::fmt;
use std::time::Duration;
use tokio::time::timeout;

/// Health status of a connection after one probe
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy connection
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Ping a connection, bounded by `check_timeout`
pub async fn probe(conn: &dyn Connection, check_timeout: Duration) -> HealthStatus {
    match timeout(check_timeout, conn.ping()).await {
        Ok(Ok(())) => HealthStatus::Healthy,
        Ok(Err(e)) => HealthStatus::Unhealthy {
            reason: e.to_string(),
        },
        Err(_) => HealthStatus::Timeout,
    }
}

/// Outcome of applying a probe result to an `active` flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Recovered,
    Failed,
}

impl Transition {
    pub fn between(was_active: bool, now_healthy: bool) -> Self {
        match (was_active, now_healthy) {
            (false, true) => Transition::Recovered,
            (true, false) => Transition::Failed,
            _ => Transition::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::MockConnection;

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "Healthy");
        assert_eq!(
            HealthStatus::Unhealthy {
                reason: "test".to_string()
            }
            .to_string(),
            "Unhealthy: test"
        );
        assert_eq!(HealthStatus::Timeout.to_string(), "Timeout");
    }

    #[test]
    fn test_health_status_is_healthy() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Unhealthy {
            reason: "test".to_string()
        }
        .is_healthy());
        assert!(!HealthStatus::Timeout.is_healthy());
    }

    #[test]
    fn test_transitions() {
        assert_eq!(Transition::between(true, true), Transition::Unchanged);
        assert_eq!(Transition::between(false, false), Transition::Unchanged);
        assert_eq!(Transition::between(false, true), Transition::Recovered);
        assert_eq!(Transition::between(true, false), Transition::Failed);
    }

    #[tokio::test]
    async fn test_probe_success_and_failure() {
        let conn = MockConnection::new("primary");
        assert!(probe(&conn, Duration::from_secs(1)).await.is_healthy());

        conn.set_ping_failing(true);
        let status = probe(&conn, Duration::from_secs(1)).await;
        assert!(matches!(status, HealthStatus::Unhealthy { .. }));
    }
}
