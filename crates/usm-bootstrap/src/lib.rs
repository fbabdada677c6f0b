//! Bootstrap initializer - registers the application descriptor on startup
//!
//! A periodic task that reads the deployment descriptor from a local source
//! and registers it with the remote administrative service through the
//! facade. Remote failures are retried on the next tick up to a fixed
//! bound; a missing or unreadable descriptor is a local misconfiguration
//! and stops the task immediately.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use usm_common::{ApplicationDescriptor, Result, UsmError};
use usm_service::UsmService;

/// Local origin of the deployment descriptor
pub trait DescriptorSource: Send + Sync {
    fn load(&self) -> Result<ApplicationDescriptor>;
}

/// Reads the descriptor from a JSON file shipped with the module
pub struct FileDescriptorSource {
    path: PathBuf,
}

impl FileDescriptorSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DescriptorSource for FileDescriptorSource {
    fn load(&self) -> Result<ApplicationDescriptor> {
        let bytes = std::fs::read(&self.path).map_err(|e| {
            UsmError::local_configuration(format!(
                "cannot read deployment descriptor {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            UsmError::local_configuration(format!(
                "deployment descriptor {} is not valid: {}",
                self.path.display(),
                e
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitializerState {
    /// No attempt made yet
    Idle,
    /// An attempt is in flight
    Attempting,
    /// Last attempt failed, waiting for the next tick
    Retrying,
    /// Terminal: the descriptor is registered
    Succeeded,
    /// Terminal: retry budget exhausted or a fatal local error
    Failed,
}

#[derive(Debug, Clone)]
pub struct InitializerConfig {
    /// Fixed tick period, independent of attempt duration
    pub period: Duration,
    /// Consecutive remote failures tolerated before giving up
    pub max_attempts: u32,
    /// Redeploy the descriptor even when the application is already
    /// registered
    pub redeploy_existing: bool,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            max_attempts: 5,
            redeploy_existing: false,
        }
    }
}

/// Deploys the application descriptor with bounded retries
pub struct ModuleInitializer {
    service: Arc<dyn UsmService>,
    source: Arc<dyn DescriptorSource>,
    config: InitializerConfig,
    state: InitializerState,
    failures: u32,
}

impl ModuleInitializer {
    pub fn new(
        service: Arc<dyn UsmService>,
        source: Arc<dyn DescriptorSource>,
        config: InitializerConfig,
    ) -> Self {
        Self {
            service,
            source,
            config,
            state: InitializerState::Idle,
            failures: 0,
        }
    }

    pub fn state(&self) -> InitializerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failures
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            InitializerState::Succeeded | InitializerState::Failed
        )
    }

    /// One scheduled attempt; a no-op once terminal. Returns the state
    /// after the tick.
    pub async fn tick(&mut self) -> InitializerState {
        if self.is_terminal() {
            return self.state;
        }
        self.state = InitializerState::Attempting;

        match self.attempt().await {
            Ok(()) => {
                self.state = InitializerState::Succeeded;
            }
            Err(e) if e.is_retryable() => {
                self.failures += 1;
                info!(
                    retry_count = self.failures,
                    error = %e,
                    "failed to reach the administrative service"
                );
                if self.failures >= self.config.max_attempts {
                    error!(
                        attempts = self.failures,
                        "deployment failed, could not register the application"
                    );
                    self.state = InitializerState::Failed;
                } else {
                    self.state = InitializerState::Retrying;
                }
            }
            Err(e) => {
                error!(error = %e, "deployment aborted");
                self.state = InitializerState::Failed;
            }
        }
        self.state
    }

    async fn attempt(&self) -> Result<()> {
        let descriptor = self.source.load()?;

        let registered = self
            .service
            .get_application_definition(&descriptor.name)
            .await?;
        match registered {
            None => self.service.deploy_application(&descriptor).await,
            Some(_) if self.config.redeploy_existing => {
                self.service.redeploy_application(&descriptor).await
            }
            Some(_) => {
                debug!(application = %descriptor.name, "application already registered");
                Ok(())
            }
        }
    }

    /// Drive ticks on the fixed period until terminal or shutdown.
    /// Reaching a terminal state cancels all future ticks.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> InitializerState {
        let mut ticker = tokio::time::interval(self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.tick().await == InitializerState::Succeeded {
                        info!("application descriptor registered, stopping initializer");
                    }
                    if self.is_terminal() {
                        break;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("initializer shutting down");
                    break;
                }
            }
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use usm_common::{Context, Dataset, DatasetExtension, UserContext, UserPreference};

    struct FixedSource(ApplicationDescriptor);

    impl DescriptorSource for FixedSource {
        fn load(&self) -> Result<ApplicationDescriptor> {
            Ok(self.0.clone())
        }
    }

    struct BrokenSource;

    impl DescriptorSource for BrokenSource {
        fn load(&self) -> Result<ApplicationDescriptor> {
            Err(UsmError::local_configuration("descriptor is not provided"))
        }
    }

    /// Facade stand-in: fails the first `fail_first` probes with a
    /// transport error, then serves from the deployed map
    struct MockUsm {
        fail_first: AtomicUsize,
        deployed: Mutex<Option<ApplicationDescriptor>>,
        probe_calls: AtomicUsize,
        deploy_calls: AtomicUsize,
        redeploy_calls: AtomicUsize,
    }

    impl MockUsm {
        fn new(fail_first: usize, deployed: Option<ApplicationDescriptor>) -> Self {
            Self {
                fail_first: AtomicUsize::new(fail_first),
                deployed: Mutex::new(deployed),
                probe_calls: AtomicUsize::new(0),
                deploy_calls: AtomicUsize::new(0),
                redeploy_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl UsmService for MockUsm {
        async fn get_application_definition(
            &self,
            _application_name: &str,
        ) -> Result<Option<ApplicationDescriptor>> {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(UsmError::transport("broker unavailable"));
            }
            Ok(self.deployed.lock().unwrap().clone())
        }

        async fn deploy_application(&self, descriptor: &ApplicationDescriptor) -> Result<()> {
            self.deploy_calls.fetch_add(1, Ordering::SeqCst);
            *self.deployed.lock().unwrap() = Some(descriptor.clone());
            Ok(())
        }

        async fn redeploy_application(&self, descriptor: &ApplicationDescriptor) -> Result<()> {
            self.redeploy_calls.fetch_add(1, Ordering::SeqCst);
            *self.deployed.lock().unwrap() = Some(descriptor.clone());
            Ok(())
        }

        async fn get_option_default_value(&self, _: &str, _: &str) -> Result<Option<String>> {
            unimplemented!("not exercised by the initializer")
        }

        async fn set_option_default_value(&self, _: &str, _: &str, _: &str) -> Result<()> {
            unimplemented!("not exercised by the initializer")
        }

        async fn get_full_user_context(&self, _: &str, _: &str) -> Result<UserContext> {
            unimplemented!("not exercised by the initializer")
        }

        async fn get_user_context(&self, _: &str, _: &str, _: &str, _: &str) -> Result<Context> {
            unimplemented!("not exercised by the initializer")
        }

        async fn get_user_preference(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Option<String>> {
            unimplemented!("not exercised by the initializer")
        }

        async fn put_user_preference(&self, _: UserPreference) -> Result<()> {
            unimplemented!("not exercised by the initializer")
        }

        async fn get_datasets_per_category(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Vec<Dataset>> {
            unimplemented!("not exercised by the initializer")
        }

        async fn create_dataset(
            &self,
            _: &str,
            _: &str,
            _: Option<&str>,
            _: Option<&str>,
            _: Option<&str>,
        ) -> Result<()> {
            unimplemented!("not exercised by the initializer")
        }

        async fn delete_dataset(&self, _: &str, _: &str) -> Result<()> {
            unimplemented!("not exercised by the initializer")
        }

        async fn find_datasets_by_discriminator(
            &self,
            _: &str,
            _: &str,
        ) -> Result<Vec<DatasetExtension>> {
            unimplemented!("not exercised by the initializer")
        }

        async fn get_user_features(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<HashSet<String>> {
            unimplemented!("not exercised by the initializer")
        }
    }

    fn descriptor() -> ApplicationDescriptor {
        ApplicationDescriptor {
            name: "reporting".to_string(),
            description: None,
            options: Vec::new(),
        }
    }

    fn initializer(mock: Arc<MockUsm>, config: InitializerConfig) -> ModuleInitializer {
        ModuleInitializer::new(mock, Arc::new(FixedSource(descriptor())), config)
    }

    #[tokio::test]
    async fn deploys_when_application_is_not_registered() {
        let mock = Arc::new(MockUsm::new(0, None));
        let mut init = initializer(mock.clone(), InitializerConfig::default());

        assert_eq!(init.tick().await, InitializerState::Succeeded);
        assert_eq!(mock.deploy_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.redeploy_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn leaves_registered_application_alone_by_default() {
        let mock = Arc::new(MockUsm::new(0, Some(descriptor())));
        let mut init = initializer(mock.clone(), InitializerConfig::default());

        assert_eq!(init.tick().await, InitializerState::Succeeded);
        assert_eq!(mock.deploy_calls.load(Ordering::SeqCst), 0);
        assert_eq!(mock.redeploy_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn redeploys_registered_application_when_policy_says_so() {
        let mock = Arc::new(MockUsm::new(0, Some(descriptor())));
        let config = InitializerConfig {
            redeploy_existing: true,
            ..Default::default()
        };
        let mut init = initializer(mock.clone(), config);

        assert_eq!(init.tick().await, InitializerState::Succeeded);
        assert_eq!(mock.redeploy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn five_consecutive_failures_exhaust_the_retry_budget() {
        let mock = Arc::new(MockUsm::new(usize::MAX, None));
        let mut init = initializer(mock.clone(), InitializerConfig::default());

        for _ in 0..4 {
            assert_eq!(init.tick().await, InitializerState::Retrying);
        }
        assert_eq!(init.tick().await, InitializerState::Failed);
        assert_eq!(init.failure_count(), 5);

        // terminal: further ticks never reach the service again
        assert_eq!(init.tick().await, InitializerState::Failed);
        assert_eq!(mock.probe_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn success_on_third_attempt_stops_further_attempts() {
        let mock = Arc::new(MockUsm::new(2, None));
        let mut init = initializer(mock.clone(), InitializerConfig::default());

        assert_eq!(init.tick().await, InitializerState::Retrying);
        assert_eq!(init.tick().await, InitializerState::Retrying);
        assert_eq!(init.tick().await, InitializerState::Succeeded);
        assert_eq!(mock.deploy_calls.load(Ordering::SeqCst), 1);

        assert_eq!(init.tick().await, InitializerState::Succeeded);
        assert_eq!(init.tick().await, InitializerState::Succeeded);
        assert_eq!(mock.probe_calls.load(Ordering::SeqCst), 3);
        assert_eq!(mock.deploy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_descriptor_is_fatal_without_retry() {
        let mock = Arc::new(MockUsm::new(0, None));
        let mut init =
            ModuleInitializer::new(mock.clone(), Arc::new(BrokenSource), InitializerConfig::default());

        assert_eq!(init.tick().await, InitializerState::Failed);
        assert_eq!(init.failure_count(), 0);
        assert_eq!(mock.probe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_stops_itself_after_success() {
        let mock = Arc::new(MockUsm::new(1, None));
        let init = initializer(mock.clone(), InitializerConfig::default());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let state = init.run(shutdown_rx).await;
        assert_eq!(state, InitializerState::Succeeded);
        assert_eq!(mock.probe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_honors_shutdown_signal() {
        let mock = Arc::new(MockUsm::new(usize::MAX, None));
        let config = InitializerConfig {
            max_attempts: u32::MAX,
            ..Default::default()
        };
        let init = initializer(mock.clone(), config);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(init.run(shutdown_rx));
        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown_tx.send(()).unwrap();

        let state = handle.await.unwrap();
        assert_eq!(state, InitializerState::Retrying);
    }

    #[tokio::test]
    async fn file_source_loads_descriptor_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("descriptor.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&descriptor()).unwrap(),
        )
        .unwrap();

        let loaded = FileDescriptorSource::new(&path).load().unwrap();
        assert_eq!(loaded.name, "reporting");

        let missing = FileDescriptorSource::new(dir.path().join("absent.json")).load();
        assert!(matches!(missing, Err(UsmError::LocalConfiguration(_))));
    }
}
