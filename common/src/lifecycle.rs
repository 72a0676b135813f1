use std::{fmt, sync::Arc, time::Duration};

use log::{error, info, warn};

use crate::{
    error::LifecycleError,
    platform::DevicePlatform,
    scheduler::{describe_chained, ActionKind, DeferredTimer, Scheduler, TimerSlot},
    timer::TimerService,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// Zero fire delay: the action already ran on the caller's context.
    Completed,
    Armed(DeferredTimer),
}

/// Maps the signed seconds used by the command surface to a chained reboot.
/// Negative means no reboot; zero means reboot immediately.
pub fn chained_reboot_from_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs).ok().map(Duration::from_secs)
}

/// Reboot, Wi-Fi reset and factory reset, immediate or deferred.
#[derive(Clone)]
pub struct Lifecycle {
    platform: Arc<dyn DevicePlatform>,
    scheduler: Scheduler,
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    pub fn new(platform: Arc<dyn DevicePlatform>, timers: Arc<dyn TimerService>) -> Self {
        Self {
            platform,
            scheduler: Scheduler::new(timers),
        }
    }

    pub fn pending(&self, slot: TimerSlot) -> Option<DeferredTimer> {
        self.scheduler.pending(slot)
    }

    /// `chained_reboot_delay` is ignored for [`ActionKind::Reboot`].
    pub fn schedule(
        &self,
        action_kind: ActionKind,
        fire_delay: Duration,
        chained_reboot_delay: Option<Duration>,
    ) -> Result<Scheduled, LifecycleError> {
        match action_kind {
            ActionKind::Reboot => self.reboot(fire_delay),
            ActionKind::WifiReset => self.wifi_reset(fire_delay, chained_reboot_delay),
            ActionKind::FactoryReset => self.factory_reset(fire_delay, chained_reboot_delay),
        }
    }

    /// A zero delay restarts right here and never returns.
    pub fn reboot(&self, delay: Duration) -> Result<Scheduled, LifecycleError> {
        if delay.is_zero() {
            self.restart_now();
        }

        let lifecycle = self.clone();
        self.scheduler
            .arm(ActionKind::Reboot, delay, None, move |_| {
                lifecycle.restart_now();
            })
            .map(Scheduled::Armed)
    }

    pub fn restart_now(&self) -> ! {
        warn!("restarting device now");
        self.platform.restart()
    }

    pub fn wifi_reset(
        &self,
        fire_delay: Duration,
        chained_reboot_delay: Option<Duration>,
    ) -> Result<Scheduled, LifecycleError> {
        if fire_delay.is_zero() {
            self.perform_wifi_reset(chained_reboot_delay);
            return Ok(Scheduled::Completed);
        }

        let lifecycle = self.clone();
        self.scheduler
            .arm(
                ActionKind::WifiReset,
                fire_delay,
                chained_reboot_delay,
                move |chained| lifecycle.perform_wifi_reset(chained),
            )
            .map(Scheduled::Armed)
    }

    pub fn factory_reset(
        &self,
        fire_delay: Duration,
        chained_reboot_delay: Option<Duration>,
    ) -> Result<Scheduled, LifecycleError> {
        if fire_delay.is_zero() {
            self.perform_factory_reset(chained_reboot_delay);
            return Ok(Scheduled::Completed);
        }

        let lifecycle = self.clone();
        self.scheduler
            .arm(
                ActionKind::FactoryReset,
                fire_delay,
                chained_reboot_delay,
                move |chained| lifecycle.perform_factory_reset(chained),
            )
            .map(Scheduled::Armed)
    }

    pub fn perform_wifi_reset(&self, chained_reboot_delay: Option<Duration>) {
        info!(
            "wifi reset: clearing network credentials (chained reboot: {})",
            describe_chained(chained_reboot_delay)
        );
        if let Err(err) = self.platform.restore_network_defaults() {
            error!("wifi reset incomplete: {err}");
        }
        self.chain_reboot(chained_reboot_delay);
    }

    /// Irreversible: every key in persistent storage is lost, not only the
    /// network credentials.
    pub fn perform_factory_reset(&self, chained_reboot_delay: Option<Duration>) {
        info!(
            "factory reset: erasing persistent storage (chained reboot: {})",
            describe_chained(chained_reboot_delay)
        );
        if let Err(err) = self.platform.deinit_storage() {
            error!("factory reset: storage deinit failed: {err}");
        }
        if let Err(err) = self.platform.erase_storage() {
            error!("factory reset: storage erase failed: {err}");
        }
        self.chain_reboot(chained_reboot_delay);
    }

    fn chain_reboot(&self, delay: Option<Duration>) {
        let Some(delay) = delay else {
            return;
        };
        if let Err(err) = self.reboot(delay) {
            warn!("chained reboot not scheduled: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{expect_restart, lifecycle_with_mocks, PlatformCall};

    #[test]
    fn negative_chained_seconds_mean_no_reboot() {
        assert_eq!(chained_reboot_from_secs(-1), None);
        assert_eq!(chained_reboot_from_secs(0), Some(Duration::ZERO));
        assert_eq!(chained_reboot_from_secs(5), Some(Duration::from_secs(5)));
    }

    #[test]
    fn immediate_reboot_never_returns() {
        let (lifecycle, platform, timers) = lifecycle_with_mocks();

        assert!(expect_restart(|| {
            let _ = lifecycle.reboot(Duration::ZERO);
        }));
        assert_eq!(platform.calls(), vec![PlatformCall::Restart]);
        assert_eq!(timers.armed_count(), 0);
    }

    #[test]
    fn immediate_wifi_reset_runs_before_returning() {
        let (lifecycle, platform, timers) = lifecycle_with_mocks();

        let outcome = lifecycle.wifi_reset(Duration::ZERO, None).unwrap();

        assert_eq!(outcome, Scheduled::Completed);
        assert_eq!(platform.calls(), vec![PlatformCall::RestoreNetwork]);
        assert_eq!(timers.armed_count(), 0);
    }

    #[test]
    fn factory_reset_deinits_before_erasing() {
        let (lifecycle, platform, _timers) = lifecycle_with_mocks();

        lifecycle.perform_factory_reset(None);

        assert_eq!(
            platform.calls(),
            vec![PlatformCall::DeinitStorage, PlatformCall::EraseStorage]
        );
    }

    #[test]
    fn chained_reboot_is_scheduled_exactly_once_with_its_delay() {
        let (lifecycle, platform, timers) = lifecycle_with_mocks();

        lifecycle.perform_wifi_reset(Some(Duration::from_secs(5)));

        let pending = lifecycle.pending(TimerSlot::Reboot).unwrap();
        assert_eq!(pending.action_kind, ActionKind::Reboot);
        assert_eq!(pending.fire_delay, Duration::from_secs(5));
        assert_eq!(timers.armed_count(), 1);
        assert_eq!(platform.calls(), vec![PlatformCall::RestoreNetwork]);
    }

    #[test]
    fn no_chained_reboot_without_delay() {
        let (lifecycle, _platform, timers) = lifecycle_with_mocks();

        lifecycle.perform_factory_reset(None);
        lifecycle.perform_wifi_reset(chained_reboot_from_secs(-1));

        assert_eq!(lifecycle.pending(TimerSlot::Reboot), None);
        assert_eq!(timers.armed_count(), 0);
    }

    #[test]
    fn zero_chained_delay_reboots_immediately() {
        let (lifecycle, platform, _timers) = lifecycle_with_mocks();

        assert!(expect_restart(|| lifecycle.perform_wifi_reset(Some(Duration::ZERO))));
        assert_eq!(
            platform.calls(),
            vec![PlatformCall::RestoreNetwork, PlatformCall::Restart]
        );
    }

    #[test]
    fn storage_failure_still_reaches_chained_reboot() {
        let (lifecycle, platform, _timers) = lifecycle_with_mocks();
        platform.fail_storage();

        lifecycle.perform_factory_reset(Some(Duration::from_secs(2)));

        assert!(lifecycle.pending(TimerSlot::Reboot).is_some());
    }

    #[test]
    fn deferred_factory_reset_fires_then_frees_the_slot() {
        let (lifecycle, platform, timers) = lifecycle_with_mocks();

        let outcome = lifecycle
            .factory_reset(Duration::from_secs(2), Some(Duration::from_secs(2)))
            .unwrap();
        let Scheduled::Armed(timer) = outcome else {
            panic!("expected an armed timer, got {outcome:?}");
        };
        assert_eq!(timer.chained_reboot_delay, Some(Duration::from_secs(2)));
        assert!(platform.calls().is_empty());

        assert!(timers.fire_next());

        assert_eq!(
            platform.calls(),
            vec![PlatformCall::DeinitStorage, PlatformCall::EraseStorage]
        );
        assert_eq!(lifecycle.pending(TimerSlot::Reset), None);
        assert_eq!(
            lifecycle.pending(TimerSlot::Reboot).map(|t| t.fire_delay),
            Some(Duration::from_secs(2))
        );
        assert!(lifecycle.wifi_reset(Duration::from_secs(2), None).is_ok());
    }

    #[test]
    fn deferred_reboot_restarts_when_fired() {
        let (lifecycle, platform, timers) = lifecycle_with_mocks();

        lifecycle.reboot(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            lifecycle.reboot(Duration::from_secs(1)),
            Err(LifecycleError::Busy(TimerSlot::Reboot))
        ));

        assert!(expect_restart(|| {
            timers.fire_next();
        }));
        assert_eq!(platform.calls(), vec![PlatformCall::Restart]);
    }

    #[test]
    fn busy_reset_keeps_first_request_parameters() {
        let (lifecycle, _platform, _timers) = lifecycle_with_mocks();

        lifecycle
            .wifi_reset(Duration::from_secs(2), Some(Duration::from_secs(5)))
            .unwrap();
        let rejected = lifecycle.schedule(
            ActionKind::FactoryReset,
            Duration::from_secs(9),
            Some(Duration::from_secs(1)),
        );

        assert!(matches!(rejected, Err(LifecycleError::Busy(TimerSlot::Reset))));
        let pending = lifecycle.pending(TimerSlot::Reset).unwrap();
        assert_eq!(pending.action_kind, ActionKind::WifiReset);
        assert_eq!(pending.fire_delay, Duration::from_secs(2));
        assert_eq!(pending.chained_reboot_delay, Some(Duration::from_secs(5)));
    }
}
