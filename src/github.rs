//! GitHub API client for the launcher's own releases.
//!
//! This module provides:
//!
//! - `GitHubClient`: HTTP client wrapper that also records rate limit headers
//! - `Release` and `ReleaseAsset`: Deserialized GitHub API responses
//! - `Platform` and `find_platform_asset`: picking the installer for this machine

use serde::Deserialize;

use crate::update::UpdateError;

/// GitHub API base URL
const GITHUB_API_BASE: &str = "https://api.github.com";

/// User agent for API requests
const USER_AGENT: &str = concat!("Gateway-Launcher/", env!("CARGO_PKG_VERSION"));

/// A GitHub release
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    pub body: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    /// Tag without the conventional `v` prefix
    pub fn version(&self) -> &str {
        self.tag_name
            .strip_prefix('v')
            .unwrap_or(&self.tag_name)
    }
}

/// An asset attached to a release
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub size: u64,
    pub browser_download_url: String,
}

/// GitHub API rate limit information
#[derive(Debug, Clone, Default)]
pub struct RateLimitInfo {
    /// Requests remaining in current window
    pub remaining: Option<u32>,
    /// Unix timestamp when limit resets
    pub reset_at: Option<i64>,
}

impl RateLimitInfo {
    fn from_response(response: &reqwest::Response) -> Self {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Self {
            remaining: header("x-ratelimit-remaining").and_then(|s| s.parse().ok()),
            reset_at: header("x-ratelimit-reset").and_then(|s| s.parse().ok()),
        }
    }

    /// Check if rate limit is low (10 or fewer remaining)
    pub fn is_low(&self) -> bool {
        self.remaining.map(|r| r <= 10).unwrap_or(false)
    }
}

/// GitHub API client bound to one repository
#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    repository: String,
}

impl GitHubClient {
    /// Create a client for `owner/name`
    pub fn new(repository: impl Into<String>) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            repository: repository.into(),
        })
    }

    /// Get a reference to the underlying HTTP client
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Newest published release. Prereleases count only when `allow_prerelease` is set.
    pub async fn latest_release(&self, allow_prerelease: bool) -> Result<Option<Release>, UpdateError> {
        let start = std::time::Instant::now();
        let releases: Vec<Release> = self
            .get_json(&format!(
                "{}/repos/{}/releases?per_page=20",
                GITHUB_API_BASE, self.repository
            ))
            .await?;

        let latest = releases
            .into_iter()
            .find(|r| !r.draft && (allow_prerelease || !r.prerelease));

        tracing::debug!(
            repository = %self.repository,
            "Fetched latest release ({:?}) in {:.1}s",
            latest.as_ref().map(|r| r.tag_name.as_str()),
            start.elapsed().as_secs_f32()
        );
        Ok(latest)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, UpdateError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await?;

        // Extract rate limit info before consuming response
        let rate_limit = RateLimitInfo::from_response(&response);
        if rate_limit.is_low() {
            tracing::warn!(
                "GitHub rate limit nearly exhausted ({:?} left)",
                rate_limit.remaining
            );
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UpdateError::Api { status, body });
        }

        Ok(response.json().await?)
    }
}

/// Operating system and CPU architecture an installer targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl Platform {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }

    /// Installer extensions in order of preference
    fn extensions(&self) -> &'static [&'static str] {
        match self.os {
            "windows" => &[".exe", ".msi"],
            "macos" => &[".dmg", ".pkg"],
            _ => &[".appimage", ".deb"],
        }
    }

    fn arch_aliases(&self) -> &'static [&'static str] {
        match self.arch {
            "x86_64" => &["x86_64", "x64", "amd64"],
            "aarch64" => &["aarch64", "arm64"],
            _ => &[],
        }
    }
}

/// Find the installer for `platform` in a release.
///
/// An asset naming the platform's architecture wins over one that names no
/// architecture; assets built for another architecture are skipped.
pub fn find_platform_asset<'a>(release: &'a Release, platform: &Platform) -> Option<&'a ReleaseAsset> {
    const ALL_ARCHES: &[&str] = &["x86_64", "x64", "amd64", "aarch64", "arm64", "x86", "i686"];
    let aliases = platform.arch_aliases();

    for ext in platform.extensions() {
        let mut neutral = None;
        for asset in &release.assets {
            let name = asset.name.to_lowercase();
            if !name.ends_with(ext) {
                continue;
            }
            if aliases.iter().any(|a| name.contains(a)) {
                return Some(asset);
            }
            let mentions_arch = ALL_ARCHES.iter().any(|a| name.contains(a));
            if !mentions_arch && neutral.is_none() {
                neutral = Some(asset);
            }
        }
        if neutral.is_some() {
            return neutral;
        }
    }

    tracing::warn!(
        "No {} {} installer in {} ({} assets)",
        platform.os,
        platform.arch,
        release.tag_name,
        release.assets.len()
    );
    None
}
