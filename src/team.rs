//! Team metadata lookups that add billing tags to snapshot labels.
//!
//! The team API answers `GET <base>/slug/<team-slug>` with the team's id,
//! business service and client. A lookup that fails or finds nothing adds no
//! tags, and never fails the snapshot it was made for.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::model::Labels;
use crate::naming::slugify;
use crate::provider::BackendFuture;
use crate::provider::http::{Auth, JsonApi};

const TEAM_SERVICE: &str = "team";
const DBAAS_COMPONENT: &str = "ce72e379db9f43409fc15458dc961962";
const SUB_COMPONENTS: [(&str, &str); 3] = [
    ("redis", "c672e379db9f43409fc15458dc96195f"),
    ("mongodb", "ea26a7fddb9f43409fc15458dc96199b"),
    ("mysql", "c672e379db9f43409fc15458dc96195f"),
];

/// Team record returned by the team API.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct Team {
    /// Team identifier.
    #[serde(default)]
    pub id: String,
    /// Business service the team bills to.
    #[serde(default, rename = "servico-de-negocio")]
    pub business_service: String,
    /// Client the team belongs to.
    #[serde(default, rename = "cliente")]
    pub client: String,
}

/// Source of team metadata.
pub trait TeamDirectory: Send + Sync {
    /// Looks a team up by slug; `None` when the team is unknown.
    fn find_team<'a>(&'a self, slug: &'a str) -> BackendFuture<'a, Option<Team>>;
}

/// [`TeamDirectory`] over the team HTTP API.
#[derive(Clone)]
pub struct TeamApiClient {
    api: JsonApi,
}

impl TeamApiClient {
    /// Builds a client rooted at `base_url`.
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            api: JsonApi::named(TEAM_SERVICE, base_url.trim(), Auth::Anonymous),
        }
    }
}

impl TeamDirectory for TeamApiClient {
    fn find_team<'a>(&'a self, slug: &'a str) -> BackendFuture<'a, Option<Team>> {
        Box::pin(async move { self.api.get_optional(&format!("slug/{slug}")).await })
    }
}

fn sub_component(engine: &str) -> Option<&'static str> {
    let family = engine
        .trim()
        .split_once('_')
        .map_or(engine.trim(), |(family, _)| family);
    SUB_COMPONENTS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(family))
        .map(|(_, id)| *id)
}

fn insert_present(tags: &mut Labels, key: &str, value: &str) {
    if !value.trim().is_empty() {
        tags.insert(key.to_owned(), value.trim().to_owned());
    }
}

/// Billing tags for `team`. The sub-component tag is only set for engines
/// with a known family, such as `mysql` or `mongodb_4_2`.
#[must_use]
pub fn team_tags(team: &Team, engine: Option<&str>) -> Labels {
    let mut tags = Labels::new();
    insert_present(&mut tags, "servico-de-negocio-id", &team.business_service);
    insert_present(&mut tags, "equipe-id", &team.id);
    insert_present(&mut tags, "componente-id", DBAAS_COMPONENT);
    if let Some(id) = engine.and_then(sub_component) {
        insert_present(&mut tags, "sub-componente-id", id);
    }
    insert_present(&mut tags, "cliente-id", &team.client);
    insert_present(&mut tags, "consumo-detalhado", "true");
    tags
}

/// Adds team billing tags and the backup marker to snapshot labels.
#[derive(Clone, Default)]
pub struct SnapshotTagger {
    directory: Option<Arc<dyn TeamDirectory>>,
    backup_tag: Option<(String, String)>,
}

impl fmt::Debug for SnapshotTagger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotTagger")
            .field("team_lookup", &self.directory.is_some())
            .field("backup_tag", &self.backup_tag)
            .finish()
    }
}

impl SnapshotTagger {
    /// Tagger configured from `team_api_url` and `backup_tag`; either may be
    /// unset.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut tagger = Self::default();
        if let Some(url) = config
            .team_api_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        {
            tagger = tagger.with_directory(Arc::new(TeamApiClient::new(url)));
        }
        if let Some(tag) = config.backup_tag.as_deref() {
            tagger = tagger.with_backup_tag(tag);
        }
        tagger
    }

    /// Looks teams up in `directory`.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn TeamDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Marks every snapshot with `tag`, written `KEY` or `KEY=VALUE`.
    #[must_use]
    pub fn with_backup_tag(mut self, tag: &str) -> Self {
        let (key, value) = tag.split_once('=').unwrap_or((tag, "true"));
        self.backup_tag = (!key.trim().is_empty())
            .then(|| (key.trim().to_owned(), value.trim().to_owned()));
        self
    }

    /// Tags for a snapshot of a database owned by `team` running `engine`.
    pub async fn tags(&self, team: Option<&str>, engine: Option<&str>) -> Labels {
        let mut tags = Labels::new();
        if let Some((key, value)) = &self.backup_tag {
            tags.insert(key.clone(), value.clone());
        }
        let name = team.map(str::trim).filter(|name| !name.is_empty());
        let (Some(directory), Some(name)) = (&self.directory, name) else {
            return tags;
        };
        let slug = slugify(name);
        match directory.find_team(&slug).await {
            Ok(Some(found)) => tags.extend(team_tags(&found, engine)),
            Ok(None) => debug!(team = %slug, "team not registered; no billing tags"),
            Err(err) => warn!(team = %slug, error = %err, "team lookup failed; no billing tags"),
        }
        tags
    }
}
