//! Session creation and initial document fetch over the HTTP API.

use anyhow::{bail, Context};
use codecollab_session::{
    CreateSpace, CreatedSpace, Language, SessionConfig, SessionDocument, SpaceSnapshot,
};
use log::{debug, info};
use reqwest::StatusCode;

/// Fetch the current document of `space_id`.
///
/// A missing session is an error; the caller must not open a socket for it.
pub async fn fetch(
    http: &reqwest::Client,
    config: &SessionConfig,
    space_id: &str,
) -> anyhow::Result<SessionDocument> {
    let url = config.snapshot_url(space_id)?;
    debug!("fetching snapshot from {url}");

    let response = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("requesting {url}"))?;
    if response.status() == StatusCode::NOT_FOUND {
        bail!("space `{space_id}` not found");
    }

    let snapshot: SpaceSnapshot = response
        .error_for_status()
        .with_context(|| format!("fetching space `{space_id}`"))?
        .json()
        .await
        .context("decoding space snapshot")?;
    Ok(SessionDocument::try_from(snapshot)?)
}

/// Create a new session and return its identifier.
pub async fn create(
    http: &reqwest::Client,
    config: &SessionConfig,
    language: Language,
) -> anyhow::Result<String> {
    let url = config.spaces_url();
    debug!("creating {language} session at {url}");

    let created: CreatedSpace = http
        .post(&url)
        .json(&CreateSpace::new(language))
        .send()
        .await
        .with_context(|| format!("requesting {url}"))?
        .error_for_status()
        .context("failed to create space")?
        .json()
        .await
        .context("decoding created space")?;
    info!("created space {}", created.space_id);
    Ok(created.space_id)
}
