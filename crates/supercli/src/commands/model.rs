use super::{CommandError, provider_arg};
use crate::app::App;

/// `/model`, `/model list [provider]`, `/model <model>` and
/// `/model <provider>[/<model>]`.
///
/// Model ids may contain slashes themselves (`openrouter/openai/gpt-4o`),
/// so only a leading known provider id is split off.
pub(super) async fn model(
    app: &mut App,
    args: &str,
) -> Result<String, CommandError> {
    let mut words = args.split_whitespace();
    match (words.next(), words.next()) {
        (None, _) => Ok(format!(
            "Current model: {}/{}\n\
             Use /model list to see the available models.",
            app.provider(),
            app.model()
        )),
        (Some("list"), provider) => {
            list(app, provider.unwrap_or_default()).await
        }
        (Some(spec), None) => switch(app, spec),
        _ => Err(CommandError::Usage(
            "/model [list [provider] | <model> | <provider>[/<model>]]",
        )),
    }
}

async fn list(app: &App, provider: &str) -> Result<String, CommandError> {
    let provider = provider_arg(app, provider)?;
    let models = if provider == app.provider() {
        app.engine().model_client().list_models().await?
    } else {
        app.catalog()[provider].profile.models.clone()
    };
    if models.is_empty() {
        return Ok(format!("{provider} did not report any models."));
    }

    let mut out = format!("Models of {provider}:");
    for model in models {
        let marker = if provider == app.provider() && model == app.model() {
            "*"
        } else {
            " "
        };
        out.push_str(&format!("\n {marker} {model}"));
    }
    Ok(out)
}

fn switch(app: &mut App, spec: &str) -> Result<String, CommandError> {
    match spec.split_once('/') {
        Some((provider, model)) if app.catalog().contains_key(provider) => {
            let model = Some(model).filter(|model| !model.is_empty());
            app.switch_provider(provider, model)?;
        }
        _ if app.catalog().contains_key(spec) => {
            app.switch_provider(spec, None)?
        }
        _ => app.set_model(spec.to_owned()),
    }
    Ok(format!("Switched to {}/{}.", app.provider(), app.model()))
}
