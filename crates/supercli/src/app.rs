use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use supercli_auth::{
    AuthError, CredentialStore, OAuthManager, OAuthManagerBuilder,
};
use supercli_core::tool::ToolOutcome;
use supercli_core::{
    Engine, EngineBuilder, EngineError, ModelClient, TurnContext, TurnOutcome,
};
use supercli_mcp::{McpManager, StdioConnector};
use supercli_model::{AuthMode, ToolCallRequest};
use supercli_openai_model::{
    Authentication, OpenAIConfigBuilder, OpenAIProvider,
};
use supercli_session::{Session, SessionError, SessionStore};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{Config, ConfigError, Paths, ProviderEntry};
use crate::tools::{self, Workspace};

const SYSTEM_PROMPT: &str = include_str!("./system_prompt.md");

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("cannot use {path} as working directory: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unknown provider `{0}`")]
    UnknownProvider(String),

    #[error(
        "provider `{0}` has no default model, pick one with /model {0}/<model>"
    )]
    NoModel(String),
}

pub type TranscriptHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type ToolCallHook = Arc<dyn Fn(&ToolCallRequest) + Send + Sync>;
pub type ToolResultHook = Arc<dyn Fn(&ToolOutcome) + Send + Sync>;
pub type NoticeHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Callbacks through which the app reports progress to the terminal.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_transcript: Option<TranscriptHook>,
    pub on_tool_call: Option<ToolCallHook>,
    pub on_tool_result: Option<ToolResultHook>,
    /// Messages that must reach the user while a command is still running,
    /// e.g. the device code of a login.
    pub on_notice: Option<NoticeHook>,
}

impl Hooks {
    fn apply(&self, mut builder: EngineBuilder) -> EngineBuilder {
        if let Some(hook) = self.on_transcript.clone() {
            builder = builder.on_transcript(move |text| hook(text));
        }
        if let Some(hook) = self.on_tool_call.clone() {
            builder = builder.on_tool_call(move |call| hook(call));
        }
        if let Some(hook) = self.on_tool_result.clone() {
            builder = builder.on_tool_result(move |outcome| hook(outcome));
        }
        builder
    }

    pub(crate) fn notice(&self, text: &str) {
        if let Some(hook) = &self.on_notice {
            hook(text);
        }
    }
}

/// Which session to start with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Resume {
    #[default]
    New,
    /// The most recently updated session.
    Latest,
    Id(Uuid),
}

#[derive(Clone, Debug)]
pub struct AppOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub workdir: PathBuf,
    pub resume: Resume,
}

/// Builds engines that share the app's tools, settings and hooks.
struct EngineFactory {
    config: Config,
    credentials: CredentialStore,
    oauth: OAuthManager,
    mcp: Arc<McpManager>,
    workspace: Workspace,
    system_prompt: String,
    hooks: Hooks,
}

impl EngineFactory {
    fn provider_for(
        &self,
        entry: &ProviderEntry,
        model: &str,
    ) -> Result<OpenAIProvider, AppError> {
        let profile = &entry.profile;
        let auth = match profile.auth {
            // A missing key is reported when the provider is used, so that
            // the user can still switch to it and set one.
            AuthMode::ApiKey => Authentication::ApiKey(
                self.credentials
                    .api_key(&profile.id, profile.api_key_env.as_deref())?
                    .unwrap_or_default(),
            ),
            AuthMode::OAuth => Authentication::OAuth {
                manager: self.oauth.clone(),
                provider: profile.id.clone(),
            },
            AuthMode::None => Authentication::None,
        };
        let config = OpenAIConfigBuilder::from_profile(profile, auth)
            .with_model(model)
            .build();
        Ok(OpenAIProvider::new(config))
    }

    fn build(
        &self,
        entry: &ProviderEntry,
        model: &str,
    ) -> Result<Engine, AppError> {
        let client = ModelClient::new(self.provider_for(entry, model)?)
            .with_rate_limits(entry.profile.rate_limits);
        Ok(self.build_with_client(client, model))
    }

    fn build_with_client(&self, client: ModelClient, model: &str) -> Engine {
        let settings = &self.config.engine;
        let client = client
            .with_retry_policy(self.config.retry.policy())
            .with_idle_timeout(settings.idle_timeout());
        let builder = EngineBuilder::with_model_client(client)
            .model(model)
            .system_prompt(self.system_prompt.clone())
            .max_tool_rounds(settings.max_tool_rounds)
            .max_consecutive_tool_failures(
                settings.max_consecutive_tool_failures,
            )
            .tool_timeout(settings.tool_timeout())
            .with_tool_source(self.mcp.clone());
        let timeout = settings.command_timeout();
        let builder = tools::register(builder, &self.workspace, timeout);
        self.hooks.apply(builder).build()
    }
}

/// Everything one interactive run works with.
pub struct App {
    factory: EngineFactory,
    catalog: BTreeMap<String, ProviderEntry>,
    sessions: SessionStore,
    provider: String,
    model: String,
    engine: Engine,
    session: Session,
}

impl App {
    pub fn new(
        config: Config,
        paths: &Paths,
        options: AppOptions,
        hooks: Hooks,
    ) -> Result<Self, AppError> {
        let catalog = config.catalog()?;
        let workspace = Workspace::new(&options.workdir).map_err(|source| {
            AppError::Workspace {
                path: options.workdir.clone(),
                source,
            }
        })?;

        let credentials = CredentialStore::new(&paths.credentials_dir);
        let mut oauth = OAuthManagerBuilder::with_store(credentials.clone());
        for (id, entry) in &catalog {
            match &entry.oauth {
                Some(client) if !client.client_id.is_empty() => {
                    oauth = oauth.with_client(id, client.clone());
                }
                _ => {}
            }
        }
        let oauth = oauth.build();

        let sessions = SessionStore::new(&paths.sessions_dir);
        let session = match options.resume {
            Resume::New => Session::new(),
            Resume::Latest => sessions.latest()?.unwrap_or_default(),
            Resume::Id(id) => sessions.load(id)?,
        };

        let connector = StdioConnector::default().with_request_timeout(
            Duration::from_secs(config.mcp.request_timeout_secs),
        );
        let servers = config.mcp.servers.iter().filter(|s| s.enabled).cloned();
        let mcp = McpManager::with_connector(servers, connector)
            .with_retry_policy(config.retry.policy());

        let system_prompt = config
            .system_prompt
            .as_deref()
            .unwrap_or(SYSTEM_PROMPT)
            .replace("{{HOST_OS}}", host_os())
            .replace(
                "{{WORKING_DIR}}",
                &workspace.root().display().to_string(),
            );

        // A resumed session continues with its own provider unless one was
        // asked for explicitly.
        let (provider, model) = match options.provider {
            Some(provider) => (provider, options.model),
            None => match &session.provider {
                Some(provider) if catalog.contains_key(provider) => (
                    provider.clone(),
                    options.model.or_else(|| session.model.clone()),
                ),
                _ => (
                    config.default_provider().to_owned(),
                    options.model.or_else(|| config.model.clone()),
                ),
            },
        };
        let entry = catalog
            .get(&provider)
            .ok_or_else(|| AppError::UnknownProvider(provider.clone()))?;
        let model = model
            .as_deref()
            .or_else(|| entry.profile.preferred_model())
            .ok_or_else(|| AppError::NoModel(provider.clone()))?
            .to_owned();

        let factory = EngineFactory {
            config,
            credentials,
            oauth,
            mcp: Arc::new(mcp),
            workspace,
            system_prompt,
            hooks,
        };
        let engine = factory.build(entry, &model)?;
        let mut app = Self {
            factory,
            catalog,
            sessions,
            provider,
            model: String::new(),
            engine,
            session,
        };
        app.set_model(model);
        Ok(app)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.factory.config
    }

    #[inline]
    pub fn catalog(&self) -> &BTreeMap<String, ProviderEntry> {
        &self.catalog
    }

    #[inline]
    pub fn credentials(&self) -> &CredentialStore {
        &self.factory.credentials
    }

    #[inline]
    pub fn oauth(&self) -> &OAuthManager {
        &self.factory.oauth
    }

    #[inline]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    #[inline]
    pub fn mcp(&self) -> &Arc<McpManager> {
        &self.factory.mcp
    }

    #[inline]
    pub fn workspace(&self) -> &Workspace {
        &self.factory.workspace
    }

    #[inline]
    pub fn hooks(&self) -> &Hooks {
        &self.factory.hooks
    }

    #[inline]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[inline]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    #[inline]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[inline]
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Persists the current session.
    pub fn save_session(&self) -> Result<(), SessionError> {
        self.sessions.save(&self.session)
    }

    /// Replaces the current session, e.g. with a loaded one. The session
    /// continues with the current provider and model.
    pub fn replace_session(&mut self, session: Session) {
        self.session = session;
        self.session.provider = Some(self.provider.clone());
        self.session.model = Some(self.model.clone());
    }

    /// Rebuilds the engine for `provider`. Without a model, the provider's
    /// default model is used.
    pub fn switch_provider(
        &mut self,
        provider: &str,
        model: Option<&str>,
    ) -> Result<(), AppError> {
        let entry = self
            .catalog
            .get(provider)
            .ok_or_else(|| AppError::UnknownProvider(provider.to_owned()))?;
        let model = model
            .or_else(|| entry.profile.preferred_model())
            .ok_or_else(|| AppError::NoModel(provider.to_owned()))?
            .to_owned();

        self.engine = self.factory.build(entry, &model)?;
        info!(provider, model, "switched provider");
        self.provider = provider.to_owned();
        self.set_model(model);
        Ok(())
    }

    /// Changes the model, keeping the provider.
    pub fn set_model(&mut self, model: String) {
        self.engine.set_model(Some(model.clone()));
        self.session.provider = Some(self.provider.clone());
        self.session.model = Some(model.clone());
        self.model = model;
    }

    /// Rebuilds the engine of the current provider, e.g. after its API key
    /// changed.
    pub fn reload_provider(&mut self) -> Result<(), AppError> {
        let provider = self.provider.clone();
        let model = self.model.clone();
        self.switch_provider(&provider, Some(&model))
    }

    /// Runs one turn of the current session.
    pub async fn run_turn(
        &mut self,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        let mut ctx = TurnContext::new(&mut self.session)
            .with_store(&self.sessions)
            .with_cancel(cancel);
        self.engine.run_turn(&mut ctx, input).await
    }

    /// Summarizes older messages of the current session.
    pub async fn compress(
        &mut self,
        keep_recent: Option<usize>,
        cancel: CancellationToken,
    ) -> Result<usize, EngineError> {
        let keep_recent =
            keep_recent.unwrap_or(self.factory.config.engine.keep_recent);
        let mut ctx = TurnContext::new(&mut self.session)
            .with_store(&self.sessions)
            .with_cancel(cancel);
        self.engine.compress(&mut ctx, keep_recent).await
    }

    /// Closes MCP connections.
    pub async fn shutdown(&self) {
        self.factory.mcp.shutdown().await;
    }

    /// Swaps the model provider while keeping every other setting. Used to
    /// drive the app with a scripted provider.
    #[cfg(test)]
    pub(crate) fn use_model_provider<P>(&mut self, provider: P)
    where
        P: supercli_model::ModelProvider + 'static,
    {
        self.engine = self
            .factory
            .build_with_client(ModelClient::new(provider), &self.model);
    }
}

#[inline]
fn host_os() -> &'static str {
    let os = std::env::consts::OS;
    match os {
        "linux" => "Linux",
        "macos" => "macOS",
        "windows" => "Windows",
        _ => "some other OS",
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use supercli_test_model::TestModelProvider;

    use super::*;

    /// An app rooted in `dir` that talks to `provider`. Sessions, credentials
    /// and the working directory all live under `dir`.
    pub(crate) fn app(
        dir: &std::path::Path,
        provider: TestModelProvider,
    ) -> App {
        let workdir = dir.join("work");
        std::fs::create_dir_all(&workdir).unwrap();
        let mut config = Config::default();
        config.retry.max_attempts = 1;
        let options = AppOptions {
            provider: Some("ollama".to_owned()),
            model: None,
            workdir,
            resume: Resume::New,
        };
        let paths = Paths::under(dir);
        let mut app =
            App::new(config, &paths, options, Hooks::default()).unwrap();
        app.use_model_provider(provider);
        app
    }
}

#[cfg(test)]
mod tests {
    use supercli_session::Role;
    use supercli_test_model::{PresetResponse, TestModelProvider};

    use super::*;

    #[test]
    fn test_startup_picks_default_provider() {
        let dir = tempfile::tempdir().unwrap();
        let options = AppOptions {
            provider: None,
            model: None,
            workdir: dir.path().to_owned(),
            resume: Resume::New,
        };
        let app = App::new(
            Config::default(),
            &Paths::under(dir.path()),
            options,
            Hooks::default(),
        )
        .unwrap();
        assert_eq!(app.provider(), "groq");
        assert_eq!(app.model(), "llama-3.3-70b-versatile");
        assert_eq!(app.session().provider.as_deref(), Some("groq"));
        assert!(!app.oauth().is_configured("gemini"));
    }

    #[test]
    fn test_unknown_provider() {
        let dir = tempfile::tempdir().unwrap();
        let options = AppOptions {
            provider: Some("nope".to_owned()),
            model: None,
            workdir: dir.path().to_owned(),
            resume: Resume::New,
        };
        let result = App::new(
            Config::default(),
            &Paths::under(dir.path()),
            options,
            Hooks::default(),
        );
        assert!(matches!(result, Err(AppError::UnknownProvider(_))));
    }

    #[tokio::test]
    async fn test_turn_is_saved_and_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let mut provider = TestModelProvider::default();
        let reply = PresetResponse::with_text("Hi there.");
        provider.add_assistant_response_step(reply);
        let mut app = testing::app(dir.path(), provider.clone());

        app.run_turn("hello", CancellationToken::new()).await.unwrap();
        let id = app.session().id;
        assert_eq!(app.session().len(), 2);

        let request = &provider.requests()[0];
        assert_eq!(request.model.as_deref(), Some("llama3.2"));
        let prompt = format!("{:?}", request.messages[0]);
        assert!(prompt.contains(&app.workspace().root().display().to_string()));

        let options = AppOptions {
            provider: None,
            model: None,
            workdir: dir.path().join("work"),
            resume: Resume::Latest,
        };
        let resumed = App::new(
            Config::default(),
            &Paths::under(dir.path()),
            options,
            Hooks::default(),
        )
        .unwrap();
        assert_eq!(resumed.session().id, id);
        assert_eq!(resumed.provider(), "ollama");
        assert_eq!(resumed.session().messages()[1].role, Role::Assistant);
    }
}
