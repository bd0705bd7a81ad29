//! Probe driver tests against a simulated peripheral
//!
//! These tests verify:
//! - Immediate termination on a valid identity
//! - The attempt budget across the whole baud ladder
//! - Fallback naming versus no-response classification
//! - Transport errors skipping a rate
//! - Cancellation between attempts

use std::time::Duration;

use portbind_detect::sim::{SimReply, VirtualPeripheral};
use portbind_detect::{
    CancelFlag, DeviceName, DeviceNode, DeviceProber, ProbeConfig, ProbeError, ProbeOutcome,
};

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    pub const BAUDS: [u32; 3] = [230_400, 115_200, 9_600];

    /// Zero delays and a short read timeout for fast tests
    pub fn fast_config() -> ProbeConfig {
        ProbeConfig {
            baud_rates: BAUDS.to_vec(),
            max_attempts: 30,
            read_timeout: Duration::from_millis(20),
            settle_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
        }
    }

    pub fn node() -> DeviceNode {
        DeviceNode::from("/dev/ttyUSB3")
    }
}

// ============================================================================
// Identification
// ============================================================================

mod identification_tests {
    use super::*;

    #[tokio::test]
    async fn mixed_case_name_is_normalised_and_stops_probing() {
        let device = VirtualPeripheral::new(|_, attempt| {
            if attempt < 4 {
                SimReply::line("pump")
            } else {
                SimReply::line("Throttle")
            }
        });
        let prober = DeviceProber::new(device, helpers::fast_config());

        let report = prober.probe(&helpers::node()).await.unwrap();

        assert_eq!(
            report.outcome,
            ProbeOutcome::Identified(DeviceName::Throttle)
        );
        assert_eq!(report.attempts, 4);
        assert_eq!(report.baud_rate, Some(230_400));
    }

    #[tokio::test]
    async fn no_bytes_sent_after_identification() {
        let device = VirtualPeripheral::always(SimReply::line("brake"));
        let prober = DeviceProber::new(device, helpers::fast_config());

        let report = prober.probe(&helpers::node()).await.unwrap();
        assert_eq!(report.outcome, ProbeOutcome::Identified(DeviceName::Brake));

        let stats = prober.opener().stats();
        assert_eq!(stats.probes_received, 1);
        assert_eq!(stats.opens, 1);
    }

    #[tokio::test]
    async fn identity_at_legacy_rate() {
        let device = VirtualPeripheral::identifying_at("steering", 9_600);
        let prober = DeviceProber::new(device, helpers::fast_config());

        let report = prober.probe(&helpers::node()).await.unwrap();

        assert_eq!(
            report.outcome,
            ProbeOutcome::Identified(DeviceName::Steering)
        );
        assert_eq!(report.attempts, 61);
        assert_eq!(report.baud_rate, Some(9_600));
    }
}

// ============================================================================
// Exhaustion
// ============================================================================

mod exhaustion_tests {
    use super::*;

    #[tokio::test]
    async fn silent_device_is_no_response() {
        let device = VirtualPeripheral::always(SimReply::Silent);
        let prober = DeviceProber::new(device, helpers::fast_config());

        let report = prober.probe(&helpers::node()).await.unwrap();

        assert_eq!(report.outcome, ProbeOutcome::NoResponse);
        assert_eq!(report.attempts, 90);
        assert_eq!(prober.opener().stats().probes_received, 90);
    }

    #[tokio::test]
    async fn hanging_device_times_out_each_attempt() {
        let mut config = helpers::fast_config();
        config.max_attempts = 2;
        config.read_timeout = Duration::from_millis(5);
        let prober = DeviceProber::new(VirtualPeripheral::always(SimReply::Hang), config);

        let report = prober.probe(&helpers::node()).await.unwrap();

        assert_eq!(report.outcome, ProbeOutcome::NoResponse);
        assert_eq!(report.attempts, 6);
    }

    #[tokio::test]
    async fn wrong_name_everywhere_is_generic_fallback() {
        let prober = DeviceProber::new(
            VirtualPeripheral::always(SimReply::line("pump")),
            helpers::fast_config(),
        );

        let report = prober.probe(&helpers::node()).await.unwrap();

        assert_eq!(
            report.outcome,
            ProbeOutcome::GenericFallback("unknown_device_at_ttyUSB3".to_string())
        );
        assert_eq!(report.attempts, 90);
    }

    #[tokio::test]
    async fn binary_garbage_is_generic_fallback() {
        let prober = DeviceProber::new(
            VirtualPeripheral::always(SimReply::Bytes(vec![0xde, 0xad, 0xbe, 0xef, b'\n'])),
            helpers::fast_config(),
        );

        let report = prober.probe(&helpers::node()).await.unwrap();

        assert!(matches!(report.outcome, ProbeOutcome::GenericFallback(_)));
    }
}

// ============================================================================
// Transport errors
// ============================================================================

mod transport_tests {
    use super::*;

    #[tokio::test]
    async fn open_failure_skips_rate_without_spending_budget() {
        let device = VirtualPeripheral::new(|baud, _| match baud {
            230_400 => SimReply::OpenFails,
            115_200 => SimReply::line("brake"),
            _ => SimReply::Silent,
        });
        let prober = DeviceProber::new(device, helpers::fast_config());

        let report = prober.probe(&helpers::node()).await.unwrap();
        let stats = prober.opener().stats();

        assert_eq!(report.outcome, ProbeOutcome::Identified(DeviceName::Brake));
        assert_eq!(stats.attempts_by_baud.get(&230_400), Some(&1));
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test]
    async fn io_failure_everywhere_is_no_response() {
        let prober = DeviceProber::new(
            VirtualPeripheral::always(SimReply::IoFails),
            helpers::fast_config(),
        );

        let report = prober.probe(&helpers::node()).await.unwrap();

        assert_eq!(report.outcome, ProbeOutcome::NoResponse);
        assert_eq!(report.attempts, 3);
    }
}

// ============================================================================
// Cancellation
// ============================================================================

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn raised_flag_aborts_before_first_attempt() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let prober = DeviceProber::new(
            VirtualPeripheral::always(SimReply::Silent),
            helpers::fast_config(),
        )
        .with_cancel(cancel);

        let result = prober.probe(&helpers::node()).await;

        assert_eq!(result, Err(ProbeError::Cancelled));
        assert_eq!(prober.opener().stats().opens, 0);
    }

    #[tokio::test]
    async fn flag_raised_mid_ladder_stops_promptly() {
        let cancel = CancelFlag::new();
        let trip = cancel.clone();
        let device = VirtualPeripheral::new(move |_, attempt| {
            if attempt == 3 {
                trip.cancel();
            }
            SimReply::Silent
        });
        let prober = DeviceProber::new(device, helpers::fast_config()).with_cancel(cancel);

        let result = prober.probe(&helpers::node()).await;

        assert_eq!(result, Err(ProbeError::Cancelled));
        assert_eq!(prober.opener().stats().opens, 3);
    }
}
