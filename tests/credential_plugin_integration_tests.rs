//! Integration tests for the credential plugin subsystem.
//!
//! These tests exercise discovery, plugin setup, and credential acquisition
//! through the public API, with scripted collaborators standing in for real
//! plugin processes.

use fcp_rs::config::EnvironmentReader;
use fcp_rs::credentials::{
    CredentialProviderBuilder, CredentialRequestType, CredentialsResultStatus,
    PluginCredentialProvider,
};
use fcp_rs::plugin::connection::{ConnectionError, ConnectionOptions, PluginConnection};
use fcp_rs::plugin::discovery::{PluginDiscovery, PluginDiscoveryResult};
use fcp_rs::plugin::factory::{Plugin, PluginFactory, PluginLauncher};
use fcp_rs::plugin::file::{PluginFile, PluginFileState};
use fcp_rs::plugin::{PluginError, PluginManager};
use fcp_rs::protocol::{
    GetAuthenticationCredentialsRequest, GetAuthenticationCredentialsResponse,
    GetOperationClaimsRequest, GetOperationClaimsResponse, InitializeResponse, Message,
    MessageMethod, MessageResponseCode,
    MonitorProcessExitResponse, OperationClaim, SetCredentialsResponse, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default)]
struct MapReader(HashMap<&'static str, String>);

impl EnvironmentReader for MapReader {
    fn get(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

#[derive(Debug)]
struct FixedDiscoverer(Vec<PluginDiscoveryResult>);

#[async_trait::async_trait]
impl PluginDiscovery for FixedDiscoverer {
    async fn discover(&self) -> Vec<PluginDiscoveryResult> {
        self.0.clone()
    }
}

fn result_for(path: &str, state: PluginFileState) -> PluginDiscoveryResult {
    PluginDiscoveryResult::new(PluginFile::new(path, state))
}

/// What a scripted plugin should do once its process is "running"
#[derive(Debug, Clone)]
struct PluginScript {
    fail_handshake: bool,
    fail_initialize: bool,
    claims: Vec<OperationClaim>,
    credentials: Option<(String, String)>,
}

impl Default for PluginScript {
    fn default() -> Self {
        Self {
            fail_handshake: false,
            fail_initialize: false,
            claims: vec![OperationClaim::Authentication],
            credentials: Some(("build-bot".to_string(), "token123".to_string())),
        }
    }
}

/// Connection double that answers each protocol method per its script
#[derive(Debug)]
struct ScriptedConnection {
    script: PluginScript,
    options: ConnectionOptions,
    alive: AtomicBool,
    established: tokio::time::Instant,
    method_counts: Mutex<HashMap<MessageMethod, usize>>,
    auth_requests: Mutex<Vec<GetAuthenticationCredentialsRequest>>,
}

impl ScriptedConnection {
    fn new(script: PluginScript) -> Self {
        Self {
            script,
            options: ConnectionOptions::default(),
            alive: AtomicBool::new(true),
            established: tokio::time::Instant::now(),
            method_counts: Mutex::new(HashMap::new()),
            auth_requests: Mutex::new(Vec::new()),
        }
    }

    fn count(&self, method: MessageMethod) -> usize {
        self.method_counts
            .lock()
            .unwrap()
            .get(&method)
            .copied()
            .unwrap_or(0)
    }

    fn auth_requests(&self) -> Vec<GetAuthenticationCredentialsRequest> {
        self.auth_requests.lock().unwrap().clone()
    }

    fn respond<T: serde::Serialize>(method: MessageMethod, payload: &T) -> Message {
        Message::response(
            "scripted",
            method,
            PROTOCOL_VERSION,
            Some(serde_json::to_value(payload).unwrap()),
        )
    }
}

#[async_trait::async_trait]
impl PluginConnection for ScriptedConnection {
    fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    fn protocol_version(&self) -> Option<String> {
        Some(PROTOCOL_VERSION.to_string())
    }

    async fn send_request(
        &self,
        method: MessageMethod,
        payload: serde_json::Value,
        _token: CancellationToken,
    ) -> Result<Message, ConnectionError> {
        if !self.is_alive() {
            return Err(ConnectionError::Closed);
        }
        *self.method_counts.lock().unwrap().entry(method).or_insert(0) += 1;

        match method {
            MessageMethod::Initialize => {
                if self.script.fail_initialize {
                    return Err(ConnectionError::Timeout(
                        "no response to Initialize".to_string(),
                    ));
                }
                Ok(Self::respond(
                    method,
                    &InitializeResponse {
                        response_code: MessageResponseCode::Success,
                    },
                ))
            }
            MessageMethod::MonitorProcessExit => Ok(Self::respond(
                method,
                &MonitorProcessExitResponse {
                    response_code: MessageResponseCode::Success,
                },
            )),
            MessageMethod::GetOperationClaims => {
                // Credential plugins are always queried source-agnostically.
                let request: GetOperationClaimsRequest =
                    serde_json::from_value(payload).unwrap();
                assert!(request.package_source_repository.is_none());

                Ok(Self::respond(
                    method,
                    &GetOperationClaimsResponse {
                        claims: self.script.claims.clone(),
                    },
                ))
            }
            MessageMethod::SetCredentials => Ok(Self::respond(
                method,
                &SetCredentialsResponse {
                    response_code: MessageResponseCode::Success,
                },
            )),
            MessageMethod::GetAuthenticationCredentials => {
                let request: GetAuthenticationCredentialsRequest =
                    serde_json::from_value(payload).unwrap();
                self.auth_requests.lock().unwrap().push(request);

                let response = match &self.script.credentials {
                    Some((username, password)) => GetAuthenticationCredentialsResponse {
                        response_code: MessageResponseCode::Success,
                        username: Some(username.clone()),
                        password: Some(password.clone()),
                        message: None,
                        authentication_types: Some(vec!["basic".to_string()]),
                    },
                    None => GetAuthenticationCredentialsResponse {
                        response_code: MessageResponseCode::NotFound,
                        username: None,
                        password: None,
                        message: Some("no credentials for this feed".to_string()),
                        authentication_types: None,
                    },
                };
                Ok(Self::respond(method, &response))
            }
            other => Err(ConnectionError::Protocol(format!(
                "unexpected method {other:?}"
            ))),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn in_flight(&self) -> usize {
        0
    }

    fn idle_for(&self) -> Duration {
        self.established.elapsed()
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Launcher double that hands out scripted connections instead of spawning
#[derive(Debug, Default)]
struct ScriptedLauncher {
    scripts: HashMap<PathBuf, PluginScript>,
    spawns: Mutex<HashMap<PathBuf, usize>>,
    connections: Mutex<Vec<(PathBuf, Arc<ScriptedConnection>)>>,
}

impl ScriptedLauncher {
    fn new(scripts: impl IntoIterator<Item = (&'static str, PluginScript)>) -> Arc<Self> {
        Arc::new(Self {
            scripts: scripts
                .into_iter()
                .map(|(path, script)| (PathBuf::from(path), script))
                .collect(),
            spawns: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
        })
    }

    fn spawn_count(&self, path: &str) -> usize {
        self.spawns
            .lock()
            .unwrap()
            .get(Path::new(path))
            .copied()
            .unwrap_or(0)
    }

    fn total_spawns(&self) -> usize {
        self.spawns.lock().unwrap().values().sum()
    }

    fn connections_for(&self, path: &str) -> Vec<Arc<ScriptedConnection>> {
        self.connections
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == Path::new(path))
            .map(|(_, connection)| Arc::clone(connection))
            .collect()
    }
}

#[async_trait::async_trait]
impl PluginLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        path: &Path,
        _args: &[String],
        _options: &ConnectionOptions,
    ) -> Result<Plugin, PluginError> {
        let script = self.scripts.get(path).cloned().unwrap_or_default();

        *self
            .spawns
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_insert(0) += 1;

        if script.fail_handshake {
            return Err(PluginError::Handshake {
                path: path.to_path_buf(),
                reason: "no handshake response within 15s".to_string(),
            });
        }

        let connection = Arc::new(ScriptedConnection::new(script));
        self.connections
            .lock()
            .unwrap()
            .push((path.to_path_buf(), Arc::clone(&connection)));

        Ok(Plugin::new(path, connection as Arc<dyn PluginConnection>))
    }
}

fn manager_over(
    launcher: &Arc<ScriptedLauncher>,
    results: Vec<PluginDiscoveryResult>,
) -> Arc<PluginManager> {
    manager_with_reader(launcher, results, MapReader::default())
}

fn manager_with_reader(
    launcher: &Arc<ScriptedLauncher>,
    results: Vec<PluginDiscoveryResult>,
    reader: MapReader,
) -> Arc<PluginManager> {
    let launcher = Arc::clone(launcher);
    Arc::new(PluginManager::new(
        Arc::new(reader),
        Arc::new(FixedDiscoverer(results)),
        Box::new(move |idle_timeout| {
            PluginFactory::new(
                Arc::clone(&launcher) as Arc<dyn PluginLauncher>,
                idle_timeout,
            )
        }),
    ))
}

async fn get_credentials(
    provider: &PluginCredentialProvider,
    uri: &str,
) -> fcp_rs::credentials::CredentialsResult {
    provider
        .get(
            uri,
            None,
            CredentialRequestType::Unauthorized,
            None,
            false,
            true,
            CancellationToken::new(),
        )
        .await
}

#[tokio::test]
async fn test_one_result_per_distinct_path_in_first_seen_order() {
    let launcher = ScriptedLauncher::new([]);
    let manager = manager_over(
        &launcher,
        vec![
            result_for("/plugins/a", PluginFileState::Valid),
            result_for("/plugins/b", PluginFileState::NotFound),
            result_for("/plugins/a", PluginFileState::Valid),
            result_for("/plugins/c", PluginFileState::Valid),
            result_for("/plugins/b", PluginFileState::NotFound),
        ],
    );

    let results = manager.find_available_plugins(CancellationToken::new()).await;

    let paths: Vec<_> = results
        .iter()
        .map(|result| result.plugin_file().path().to_path_buf())
        .collect();
    assert_eq!(
        paths,
        vec![
            PathBuf::from("/plugins/a"),
            PathBuf::from("/plugins/b"),
            PathBuf::from("/plugins/c"),
        ]
    );
    assert!(results[0].message().is_none());
    assert!(results[1].message().is_some());
    assert!(results[2].message().is_none());
}

#[tokio::test]
async fn test_no_process_is_spawned_for_non_valid_plugins() {
    let launcher = ScriptedLauncher::new([]);
    let manager = manager_over(
        &launcher,
        vec![
            result_for("/plugins/unsigned", PluginFileState::InvalidEmbeddedSignature),
            result_for("/plugins/relative", PluginFileState::InvalidFilePath),
            result_for("/plugins/gone", PluginFileState::NotFound),
        ],
    );

    let results = manager.find_available_plugins(CancellationToken::new()).await;

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|result| result.message().is_some()));
    assert_eq!(launcher.total_spawns(), 0);

    // Constructing an adapter directly over a non-valid result fails loudly.
    let error = PluginCredentialProvider::new(Arc::clone(&manager), &results[0]).unwrap_err();
    assert!(matches!(error, fcp_rs::Error::Contract(_)));
}

#[tokio::test]
async fn test_scenario_a_download_only_plugin_is_not_applicable() {
    let launcher = ScriptedLauncher::new([(
        "/plugins/a",
        PluginScript {
            claims: vec![OperationClaim::DownloadPackage],
            ..PluginScript::default()
        },
    )]);
    let manager = manager_over(
        &launcher,
        vec![result_for("/plugins/a", PluginFileState::Valid)],
    );

    let results = manager.find_available_plugins(CancellationToken::new()).await;
    let provider = PluginCredentialProvider::new(Arc::clone(&manager), &results[0]).unwrap();

    let outcome = get_credentials(&provider, "https://feed.example/index.json").await;

    assert_eq!(outcome.status, CredentialsResultStatus::ProviderNotApplicable);
    let connections = launcher.connections_for("/plugins/a");
    let connection = &connections[0];
    assert_eq!(
        connection.count(MessageMethod::GetAuthenticationCredentials),
        0
    );
}

#[tokio::test]
async fn test_scenario_b_credentials_pass_through_unchanged() {
    let launcher = ScriptedLauncher::new([("/plugins/a", PluginScript::default())]);
    let manager = manager_over(
        &launcher,
        vec![result_for("/plugins/a", PluginFileState::Valid)],
    );

    let results = manager.find_available_plugins(CancellationToken::new()).await;
    let provider = PluginCredentialProvider::new(Arc::clone(&manager), &results[0]).unwrap();

    let outcome = get_credentials(&provider, "https://feed.example/index.json").await;

    assert_eq!(outcome.status, CredentialsResultStatus::Success);
    let credentials = outcome.credentials.unwrap();
    assert_eq!(credentials.username.as_deref(), Some("build-bot"));
    assert_eq!(credentials.password.as_deref(), Some("token123"));

    let connections = launcher.connections_for("/plugins/a");
    let connection = &connections[0];
    let sent = connection.auth_requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].uri, "https://feed.example/index.json");
    assert!(!sent[0].is_proxy_request);
    assert!(!sent[0].is_retry);
    assert!(sent[0].non_interactive);
}

#[tokio::test]
async fn test_claims_are_queried_once_with_a_null_source() {
    let launcher = ScriptedLauncher::new([("/plugins/a", PluginScript::default())]);
    let manager = manager_over(
        &launcher,
        vec![result_for("/plugins/a", PluginFileState::Valid)],
    );

    let results = manager.find_available_plugins(CancellationToken::new()).await;
    let provider = PluginCredentialProvider::new(Arc::clone(&manager), &results[0]).unwrap();

    get_credentials(&provider, "https://feed.example/index.json").await;
    get_credentials(&provider, "https://feed.example/index.json").await;

    let connections = launcher.connections_for("/plugins/a");
    let connection = &connections[0];
    assert_eq!(connection.count(MessageMethod::GetOperationClaims), 1);
    assert_eq!(connection.count(MessageMethod::Initialize), 1);
    assert_eq!(
        connection.count(MessageMethod::GetAuthenticationCredentials),
        2
    );
}

#[tokio::test]
async fn test_set_credentials_is_pushed_once_for_claiming_plugins() {
    let launcher = ScriptedLauncher::new([
        ("/plugins/claiming", PluginScript::default()),
        (
            "/plugins/claimless",
            PluginScript {
                claims: Vec::new(),
                ..PluginScript::default()
            },
        ),
    ]);
    let manager = manager_over(
        &launcher,
        vec![
            result_for("/plugins/claiming", PluginFileState::Valid),
            result_for("/plugins/claimless", PluginFileState::Valid),
        ],
    );

    manager.find_available_plugins(CancellationToken::new()).await;

    let claiming_connections = launcher.connections_for("/plugins/claiming");
    let claiming = &claiming_connections[0];
    assert_eq!(claiming.count(MessageMethod::SetCredentials), 1);

    let claimless_connections = launcher.connections_for("/plugins/claimless");
    let claimless = &claimless_connections[0];
    assert_eq!(claimless.count(MessageMethod::SetCredentials), 0);
}

#[tokio::test]
async fn test_scenario_d_handshake_failure_excludes_only_that_plugin() {
    let launcher = ScriptedLauncher::new([
        (
            "/plugins/hung",
            PluginScript {
                fail_handshake: true,
                ..PluginScript::default()
            },
        ),
        ("/plugins/good", PluginScript::default()),
    ]);
    let manager = manager_over(
        &launcher,
        vec![
            result_for("/plugins/hung", PluginFileState::Valid),
            result_for("/plugins/good", PluginFileState::Valid),
        ],
    );

    let results = manager.find_available_plugins(CancellationToken::new()).await;

    assert_eq!(results.len(), 2);
    let hung = &results[0];
    assert!(hung.message().unwrap().contains("handshake"));

    let good = &results[1];
    assert!(good.message().is_none());
    let provider = PluginCredentialProvider::new(Arc::clone(&manager), good).unwrap();
    let outcome = get_credentials(&provider, "https://feed.example/index.json").await;
    assert_eq!(outcome.status, CredentialsResultStatus::Success);
}

#[tokio::test]
async fn test_initialize_failure_surfaces_as_failure_not_fault() {
    let launcher = ScriptedLauncher::new([(
        "/plugins/a",
        PluginScript {
            fail_initialize: true,
            ..PluginScript::default()
        },
    )]);
    let manager = manager_over(
        &launcher,
        vec![result_for("/plugins/a", PluginFileState::Valid)],
    );

    let results = manager.find_available_plugins(CancellationToken::new()).await;
    assert!(results[0].message().unwrap().contains("initialize"));

    let provider = PluginCredentialProvider::new(Arc::clone(&manager), &results[0]).unwrap();
    let outcome = get_credentials(&provider, "https://feed.example/index.json").await;
    assert_eq!(outcome.status, CredentialsResultStatus::Failure);
}

#[tokio::test]
async fn test_concurrent_credential_requests_share_one_process() {
    init_tracing();
    let launcher = ScriptedLauncher::new([("/plugins/a", PluginScript::default())]);
    let manager = manager_over(
        &launcher,
        vec![result_for("/plugins/a", PluginFileState::Valid)],
    );

    let results = manager.find_available_plugins(CancellationToken::new()).await;
    let provider =
        PluginCredentialProvider::new(Arc::clone(&manager), &results[0]).unwrap();

    let outcomes = futures::future::join_all(
        (0..8).map(|_| get_credentials(&provider, "https://feed.example/index.json")),
    )
    .await;

    for outcome in outcomes {
        assert_eq!(outcome.status, CredentialsResultStatus::Success);
    }

    assert_eq!(launcher.spawn_count("/plugins/a"), 1);
    let connections = launcher.connections_for("/plugins/a");
    let connection = &connections[0];
    assert_eq!(
        connection.count(MessageMethod::GetAuthenticationCredentials),
        8
    );
}

#[tokio::test]
async fn test_reinitialize_disposes_plugins_and_yields_fresh_processes() -> anyhow::Result<()> {
    init_tracing();
    let launcher = ScriptedLauncher::new([("/plugins/a", PluginScript::default())]);
    let manager = manager_over(
        &launcher,
        vec![result_for("/plugins/a", PluginFileState::Valid)],
    );

    manager.find_available_plugins(CancellationToken::new()).await;
    let first = manager.get_plugin(Path::new("/plugins/a")).await?;
    assert_eq!(launcher.spawn_count("/plugins/a"), 1);

    let replacement = ScriptedLauncher::new([("/plugins/a", PluginScript::default())]);
    {
        let replacement = Arc::clone(&replacement);
        manager
            .reinitialize(
                Arc::new(MapReader::default()),
                Arc::new(FixedDiscoverer(vec![result_for(
                    "/plugins/a",
                    PluginFileState::Valid,
                )])),
                Box::new(move |idle_timeout| {
                    PluginFactory::new(
                        Arc::clone(&replacement) as Arc<dyn PluginLauncher>,
                        idle_timeout,
                    )
                }),
            )
            .await;
    }

    // The old process is gone, not leaked.
    assert!(!first.connection().is_alive());

    let second = manager.get_plugin(Path::new("/plugins/a")).await?;
    assert_eq!(replacement.spawn_count("/plugins/a"), 1);
    assert_ne!(first.id(), second.id());
    assert!(second.started_at() >= first.started_at());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_scenario_c_idle_plugin_is_evicted_then_respawned_on_use() {
    let launcher = ScriptedLauncher::new([("/plugins/a", PluginScript::default())]);
    let reader = MapReader(HashMap::from([(
        "FCP_PLUGIN_IDLE_TIMEOUT_IN_SECONDS",
        "1".to_string(),
    )]));
    let manager = manager_with_reader(
        &launcher,
        vec![result_for("/plugins/a", PluginFileState::Valid)],
        reader,
    );

    let results = manager.find_available_plugins(CancellationToken::new()).await;
    assert_eq!(launcher.spawn_count("/plugins/a"), 1);

    // Sit idle past the timeout; the factory evicts the plugin.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!launcher.connections_for("/plugins/a")[0].is_alive());

    // The next credential request transparently respawns it.
    let provider = PluginCredentialProvider::new(Arc::clone(&manager), &results[0]).unwrap();
    let outcome = get_credentials(&provider, "https://feed.example/index.json").await;

    assert_eq!(outcome.status, CredentialsResultStatus::Success);
    assert_eq!(launcher.spawn_count("/plugins/a"), 2);
}

#[tokio::test]
async fn test_builder_creates_one_provider_per_valid_plugin() {
    let launcher = ScriptedLauncher::new([
        ("/plugins/a", PluginScript::default()),
        ("/plugins/c", PluginScript::default()),
    ]);
    let manager = manager_over(
        &launcher,
        vec![
            result_for("/plugins/a", PluginFileState::Valid),
            result_for("/plugins/b", PluginFileState::InvalidEmbeddedSignature),
            result_for("/plugins/c", PluginFileState::Valid),
        ],
    );

    let providers = CredentialProviderBuilder::new(manager)
        .build_all(CancellationToken::new())
        .await;

    assert_eq!(providers.len(), 2);
    assert!(providers[0].id().contains("/plugins/a"));
    assert!(providers[1].id().contains("/plugins/c"));
}
