use supercli_auth::DeviceAuthorization;
use supercli_model::AuthMode;
use tokio_util::sync::CancellationToken;

use super::{CommandError, provider_arg};
use crate::app::App;

pub(super) async fn login(
    app: &mut App,
    args: &str,
    cancel: &CancellationToken,
) -> Result<String, CommandError> {
    let provider = provider_arg(app, args)?.to_owned();
    match app.catalog()[&provider].profile.auth {
        AuthMode::OAuth => {}
        AuthMode::ApiKey => {
            return Ok(format!(
                "{provider} uses an API key, set it with /key {provider} <key>"
            ));
        }
        AuthMode::None => return Ok(format!("{provider} needs no login.")),
    }
    if !app.oauth().is_configured(&provider) {
        return Err(CommandError::Invalid(format!(
            "no OAuth client is configured for {provider}, set `client_id` \
             under [oauth_clients.{provider}] in config.toml"
        )));
    }

    let hooks = app.hooks().clone();
    let on_code = |auth: &DeviceAuthorization| {
        let url = auth
            .verification_uri_complete
            .as_deref()
            .unwrap_or(&auth.verification_uri);
        hooks.notice(&format!(
            "Open {url} and enter the code {} to log in to {provider}.",
            auth.user_code
        ));
    };
    let flow = app.oauth().authenticate(&provider, on_code);
    tokio::select! {
        result = flow => {
            result?;
            Ok(format!("Logged in to {provider}."))
        }
        _ = cancel.cancelled() => Ok("Login cancelled.".to_owned()),
    }
}

pub(super) async fn logout(
    app: &mut App,
    args: &str,
) -> Result<String, CommandError> {
    let provider = provider_arg(app, args)?.to_owned();
    match app.catalog()[&provider].profile.auth {
        AuthMode::OAuth => {
            if app.oauth().logout(&provider).await? {
                Ok(format!("Logged out of {provider}."))
            } else {
                Ok(format!("Not logged in to {provider}."))
            }
        }
        AuthMode::ApiKey => {
            if !app.credentials().remove_api_key(&provider)? {
                return Ok(format!("No stored API key for {provider}."));
            }
            if provider == app.provider() {
                app.reload_provider()?;
            }
            Ok(format!("Removed the stored API key of {provider}."))
        }
        AuthMode::None => Ok(format!("{provider} needs no login.")),
    }
}

pub(super) fn key(app: &mut App, args: &str) -> Result<String, CommandError> {
    let words: Vec<&str> = args.split_whitespace().collect();
    let (provider, key) = match words.as_slice() {
        [] => return key_status(app),
        [key] => (app.provider().to_owned(), *key),
        [provider, key] => (provider_arg(app, provider)?.to_owned(), *key),
        _ => return Err(CommandError::Usage("/key [provider] <api key>")),
    };
    if app.catalog()[&provider].profile.auth != AuthMode::ApiKey {
        return Err(CommandError::Invalid(format!(
            "{provider} does not use API keys"
        )));
    }

    app.credentials().set_api_key(&provider, key)?;
    if provider == app.provider() {
        app.reload_provider()?;
    }
    Ok(format!("Saved the API key of {provider}."))
}

fn key_status(app: &App) -> Result<String, CommandError> {
    let mut out = String::from("API keys:");
    for (id, entry) in app.catalog() {
        let profile = &entry.profile;
        if profile.auth != AuthMode::ApiKey {
            continue;
        }
        let env = profile.api_key_env.as_deref();
        let status = match app.credentials().api_key(id, env)? {
            Some(_) => "set",
            None => "missing",
        };
        let hint = env.map(|env| format!(" (or ${env})")).unwrap_or_default();
        out.push_str(&format!("\n  {id}: {status}{hint}"));
    }
    Ok(out)
}
