use crate::classify::{Phase, SweepError};
use crate::driver::TargetDriver;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// One live connection generation. Not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

/// Owns the driver and the connection lifecycle. Generations only go up.
pub struct SessionManager {
    driver: Box<dyn TargetDriver>,
    current: Option<Session>,
    generation: u64,
    connect_timeout: Duration,
}

impl SessionManager {
    pub fn new(driver: Box<dyn TargetDriver>, connect_timeout: Duration) -> Self {
        Self {
            driver,
            current: None,
            generation: 0,
            connect_timeout,
        }
    }

    pub fn start(&mut self) -> Result<&Session, SweepError> {
        self.generation += 1;
        let generation = self.generation;
        tracing::info!(generation, "starting driver session");
        self.driver
            .connect(self.connect_timeout)
            .map_err(|e| SweepError::driver(Phase::Connect, e))?;
        Ok(self.current.insert(Session {
            generation,
            started_at: Utc::now(),
        }))
    }

    pub fn restart(&mut self) -> Result<&Session, SweepError> {
        if let Some(old) = self.current.take() {
            tracing::warn!(generation = old.generation, "tearing down driver session");
        }
        self.driver.disconnect();
        self.start()
    }

    pub fn shutdown(&mut self) {
        if self.current.take().is_some() {
            self.driver.disconnect();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current.is_some()
    }

    /// Generation of the newest session, live or not.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn driver(&mut self) -> &mut dyn TargetDriver {
        self.driver.as_mut()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverErrorKind;
    use crate::testing::{FakeTarget, ScriptedDriver};

    #[test]
    fn generations_increase_across_restarts() {
        let (driver, state) = ScriptedDriver::new(FakeTarget::with_pack("p", 3));
        let mut sessions = SessionManager::new(Box::new(driver), Duration::from_millis(10));
        assert!(!sessions.is_connected());
        assert_eq!(sessions.start().expect("start").generation, 1);
        assert_eq!(sessions.restart().expect("restart").generation, 2);
        assert_eq!(state.borrow().connects, 2);
        assert_eq!(state.borrow().disconnects, 1);
        sessions.shutdown();
        assert!(!sessions.is_connected());
        assert_eq!(sessions.generation(), 2);
    }

    #[test]
    fn failed_connect_still_consumes_a_generation() {
        let mut target = FakeTarget::with_pack("p", 3);
        target.fail_connect = Some(DriverErrorKind::Crashed);
        let (driver, _state) = ScriptedDriver::new(target);
        let mut sessions = SessionManager::new(Box::new(driver), Duration::from_millis(10));
        let err = sessions.start().expect_err("connect fails");
        assert_eq!(err.phase(), Phase::Connect);
        assert_eq!(err.driver_kind(), Some(DriverErrorKind::Crashed));
        assert_eq!(sessions.generation(), 1);
        assert!(!sessions.is_connected());
    }
}
