//! Ingress policing backends.
//!
//! [`OvsShaper`] drives Open vSwitch through `ovs-vsctl`, setting both the
//! policing rate and burst in one invocation so the pair is never observed
//! half-applied. [`DryRunShaper`] only logs.

use std::io;
use std::process::{Command, ExitStatus};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Applies an ingress rate limit to a named interface.
pub trait TrafficShaper: Send {
    fn shape(&mut self, interface: &str, rate_kbps: u64, burst_kb: u64) -> Result<(), ShapeError>;
}

impl<T: TrafficShaper + ?Sized> TrafficShaper for Box<T> {
    fn shape(&mut self, interface: &str, rate_kbps: u64, burst_kb: u64) -> Result<(), ShapeError> {
        (**self).shape(interface, rate_kbps, burst_kb)
    }
}

/// Open vSwitch ingress policing via `ovs-vsctl`.
#[derive(Debug, Clone)]
pub struct OvsShaper {
    program: String,
}

impl Default for OvsShaper {
    fn default() -> Self {
        Self::new("ovs-vsctl")
    }
}

impl OvsShaper {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Argument list for one combined rate + burst update.
    pub fn args(interface: &str, rate_kbps: u64, burst_kb: u64) -> Vec<String> {
        vec![
            "set".into(),
            "interface".into(),
            interface.into(),
            format!("ingress_policing_rate={rate_kbps}"),
            format!("ingress_policing_burst={burst_kb}"),
        ]
    }
}

impl TrafficShaper for OvsShaper {
    fn shape(&mut self, interface: &str, rate_kbps: u64, burst_kb: u64) -> Result<(), ShapeError> {
        let args = Self::args(interface, rate_kbps, burst_kb);
        debug!(program = %self.program, args = %args.join(" "), "running shaper");

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| ShapeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ShapeError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Logs the would-be policing settings without touching the system.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunShaper;

impl DryRunShaper {
    pub fn new() -> Self {
        DryRunShaper
    }
}

impl TrafficShaper for DryRunShaper {
    fn shape(&mut self, interface: &str, rate_kbps: u64, burst_kb: u64) -> Result<(), ShapeError> {
        info!(interface, rate_kbps, burst_kb, "dry run: ingress policing");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ovs_arguments() {
        assert_eq!(
            OvsShaper::args("s1-eth1", 2500, 2000),
            vec![
                "set",
                "interface",
                "s1-eth1",
                "ingress_policing_rate=2500",
                "ingress_policing_burst=2000",
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn successful_command() {
        let mut shaper = OvsShaper::new("true");
        assert!(shaper.shape("s1-eth1", 1000, 1000).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_status() {
        let mut shaper = OvsShaper::new("false");
        let err = shaper.shape("s1-eth1", 1000, 1000).unwrap_err();
        assert!(matches!(err, ShapeError::Failed { .. }));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let mut shaper = OvsShaper::new("/nonexistent/ovs-vsctl-missing");
        let err = shaper.shape("s1-eth1", 1000, 1000).unwrap_err();
        assert!(matches!(err, ShapeError::Spawn { .. }));
        assert!(err.to_string().contains("ovs-vsctl-missing"));
    }

    #[test]
    fn dry_run_always_succeeds() {
        let mut shaper: Box<dyn TrafficShaper> = Box::new(DryRunShaper::new());
        assert!(shaper.shape("eth0", 1, 1).is_ok());
        assert!(shaper.shape("eth0", 2, 2).is_ok());
    }
}
