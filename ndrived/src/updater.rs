//! Auto-update compatibility engine.
//!
//! The decision logic is a pure function over the current version, the
//! published catalog, the active channel, the server version and the
//! server's login capability. The surrounding worker only fetches the
//! catalog and acts on the computed status.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid channel: {0}")]
pub struct InvalidChannel(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Release,
    Beta,
    Alpha,
    /// Versions pinned by the administrator.
    Centralized,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Release => "release",
            Channel::Beta => "beta",
            Channel::Alpha => "alpha",
            Channel::Centralized => "centralized",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidChannel> {
        match value.to_ascii_lowercase().as_str() {
            "release" => Ok(Channel::Release),
            "beta" => Ok(Channel::Beta),
            "alpha" => Ok(Channel::Alpha),
            "centralized" => Ok(Channel::Centralized),
            other => Err(InvalidChannel(other.to_string())),
        }
    }

    /// Wider channels accept narrower releases: beta users also get release
    /// builds, alpha users get everything.
    fn accepts(&self, candidate: Channel) -> bool {
        let rank = |channel: Channel| match channel {
            Channel::Release => 0,
            Channel::Beta => 1,
            Channel::Alpha => 2,
            Channel::Centralized => 0,
        };
        rank(candidate) <= rank(*self)
    }
}

/// What login flows the bound servers still expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoginCapability {
    pub old: bool,
    pub new: bool,
}

impl LoginCapability {
    pub const UNKNOWN: Self = Self {
        old: false,
        new: false,
    };

    pub fn old_only() -> Self {
        Self {
            old: true,
            new: false,
        }
    }

    pub fn new_only() -> Self {
        Self {
            old: false,
            new: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate,
    UpdateAvailable,
    IncompatibleServer,
    WrongChannel,
    MissingVersion,
    UnavailableSite,
    Updating,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::UpToDate => "up_to_date",
            UpdateStatus::UpdateAvailable => "update_available",
            UpdateStatus::IncompatibleServer => "incompatible_server",
            UpdateStatus::WrongChannel => "wrong_channel",
            UpdateStatus::MissingVersion => "missing_version",
            UpdateStatus::UnavailableSite => "unavailable_site",
            UpdateStatus::Updating => "updating",
        }
    }
}

/// Catalog entry for one published client version.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "type", default)]
    pub channel: Option<String>,
    /// Minimum server version per server base branch.
    #[serde(default)]
    pub min_all: BTreeMap<String, String>,
    /// Maximum server version per server base branch.
    #[serde(default)]
    pub max_all: BTreeMap<String, String>,
    #[serde(default)]
    pub checksum: Option<Checksum>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Checksum {
    #[serde(default = "default_algo")]
    pub algo: String,
    #[serde(default)]
    pub appimage: Option<String>,
    #[serde(default)]
    pub deb: Option<String>,
    #[serde(default)]
    pub rpm: Option<String>,
}

fn default_algo() -> String {
    "sha256".to_string()
}

impl VersionInfo {
    fn channel(&self) -> Channel {
        self.channel
            .as_deref()
            .and_then(|value| Channel::parse(value).ok())
            .unwrap_or(Channel::Release)
    }

    /// A candidate is compatible when the server falls inside its
    /// `[min, max]` bounds for the server's base branch.
    fn compatible_with(&self, server: Option<&str>) -> bool {
        let Some(server) = server else { return false };
        let base = base_branch(server);
        match self.min_all.get(base) {
            Some(min) => {
                if version_cmp(server, min) == Ordering::Less {
                    return false;
                }
            }
            None => return false,
        }
        if let Some(max) = self.max_all.get(base)
            && version_cmp(server, max) == Ordering::Greater
        {
            return false;
        }
        true
    }
}

/// Computes `(status, version)` for the given inputs, or `None` when there
/// is nothing to say (local/dev builds absent from the catalog).
pub fn get_update_status(
    current: &str,
    versions: &BTreeMap<String, VersionInfo>,
    channel: Channel,
    server_version: Option<&str>,
    login: LoginCapability,
    pinned_version: Option<&str>,
) -> Option<(UpdateStatus, String)> {
    if versions.is_empty() {
        return None;
    }

    if channel == Channel::Centralized {
        return match pinned_version {
            Some(pinned) => centralized_status(current, versions, server_version, login, pinned),
            // Without an administrator pin the centralized channel behaves
            // like release.
            None => get_update_status(
                current,
                versions,
                Channel::Release,
                server_version,
                login,
                None,
            ),
        };
    }

    let compatible: BTreeMap<&str, &VersionInfo> = versions
        .iter()
        .filter(|(version, info)| {
            channel.accepts(info.channel())
                && info.compatible_with(server_version)
                && !filtered_by_login(version, login)
        })
        .map(|(version, info)| (version.as_str(), info))
        .collect();

    let latest = compatible
        .keys()
        .copied()
        .max_by(|a, b| version_cmp(a, b));

    let current_channel = channel_of_current(current, versions);
    if current_channel != channel {
        // Running a build from another channel: propose the newest build of
        // the active channel, flagged accordingly when it is not newer.
        return match latest {
            Some(latest) if version_cmp(latest, current) == Ordering::Greater => {
                Some((UpdateStatus::UpdateAvailable, latest.to_string()))
            }
            Some(latest) => Some((UpdateStatus::WrongChannel, latest.to_string())),
            None => None,
        };
    }

    if !versions.contains_key(current) {
        // Local or development build: propose nothing.
        return None;
    }

    match latest {
        None => Some((UpdateStatus::IncompatibleServer, String::new())),
        Some(latest) => match version_cmp(latest, current) {
            Ordering::Equal => Some((UpdateStatus::UpToDate, String::new())),
            Ordering::Greater => Some((UpdateStatus::UpdateAvailable, latest.to_string())),
            // Every compatible version is older: forced downgrade.
            Ordering::Less => Some((UpdateStatus::IncompatibleServer, latest.to_string())),
        },
    }
}

fn centralized_status(
    current: &str,
    versions: &BTreeMap<String, VersionInfo>,
    server_version: Option<&str>,
    login: LoginCapability,
    pinned: &str,
) -> Option<(UpdateStatus, String)> {
    if pinned == current {
        return Some((UpdateStatus::UpToDate, String::new()));
    }
    let Some(info) = versions.get(pinned) else {
        return Some((UpdateStatus::MissingVersion, pinned.to_string()));
    };
    // The administrator's pin overrides channel membership.
    if !info.compatible_with(server_version) || filtered_by_login(pinned, login) {
        return Some((UpdateStatus::IncompatibleServer, pinned.to_string()));
    }
    Some((UpdateStatus::UpdateAvailable, pinned.to_string()))
}

/// Clients requiring the new browser login cannot serve users still bound
/// to servers that only speak the old flow.
fn filtered_by_login(version: &str, login: LoginCapability) -> bool {
    login.old && !login.new && major_of(version) >= 4
}

/// Channel the running build belongs to: taken from the catalog when
/// listed, inferred from the version shape otherwise (four numeric
/// components mark an alpha build).
fn channel_of_current(current: &str, versions: &BTreeMap<String, VersionInfo>) -> Channel {
    if let Some(info) = versions.get(current) {
        return info.channel();
    }
    if numeric_parts(current).len() >= 4 {
        return Channel::Alpha;
    }
    Channel::Release
}

//
// Version ordering
//

fn numeric_parts(version: &str) -> Vec<u64> {
    let stripped = version.split(['-', '+']).next().unwrap_or(version);
    stripped
        .split('.')
        .filter_map(|part| part.parse().ok())
        .collect()
}

fn hf_of(version: &str) -> u64 {
    version
        .split('-')
        .nth(1)
        .and_then(|suffix| suffix.strip_prefix("HF"))
        .and_then(|number| number.parse().ok())
        .unwrap_or(0)
}

/// Base branch of a server version: the hotfix suffix is not part of the
/// branch ("10.10-HF12" lives on "10.10").
pub fn base_branch(version: &str) -> &str {
    version.split('-').next().unwrap_or(version)
}

pub fn version_cmp(a: &str, b: &str) -> Ordering {
    let pa = numeric_parts(a);
    let pb = numeric_parts(b);
    let len = pa.len().max(pb.len());
    for idx in 0..len {
        let va = pa.get(idx).copied().unwrap_or(0);
        let vb = pb.get(idx).copied().unwrap_or(0);
        match va.cmp(&vb) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    hf_of(a).cmp(&hf_of(b))
}

fn major_of(version: &str) -> u64 {
    numeric_parts(version).first().copied().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(channel: &str, min: &[(&str, &str)]) -> VersionInfo {
        VersionInfo {
            channel: Some(channel.to_string()),
            min_all: min
                .iter()
                .map(|(branch, version)| (branch.to_string(), version.to_string()))
                .collect(),
            max_all: BTreeMap::new(),
            checksum: None,
        }
    }

    fn catalog(entries: &[(&str, VersionInfo)]) -> BTreeMap<String, VersionInfo> {
        entries
            .iter()
            .map(|(version, info)| (version.to_string(), info.clone()))
            .collect()
    }

    #[test]
    fn version_ordering_handles_hotfixes_and_lengths() {
        assert_eq!(version_cmp("10.10", "10.10"), Ordering::Equal);
        assert_eq!(version_cmp("10.10-HF12", "10.10"), Ordering::Greater);
        assert_eq!(version_cmp("10.10-HF12", "10.10-HF47"), Ordering::Less);
        assert_eq!(version_cmp("4.0.2", "4.0.2.13"), Ordering::Less);
        assert_eq!(version_cmp("4.1.0", "4.0.9"), Ordering::Greater);
        assert_eq!(base_branch("10.10-HF47"), "10.10");
    }

    #[test]
    fn up_to_date_when_current_is_the_latest_compatible() {
        let versions = catalog(&[
            ("4.0.1", info("release", &[("10.10", "10.10")])),
            ("4.0.2", info("release", &[("10.10", "10.10")])),
        ]);
        let status = get_update_status(
            "4.0.2",
            &versions,
            Channel::Release,
            Some("10.10-HF20"),
            LoginCapability::new_only(),
            None,
        );
        assert_eq!(status, Some((UpdateStatus::UpToDate, String::new())));
    }

    #[test]
    fn newer_compatible_version_is_proposed() {
        let versions = catalog(&[
            ("4.0.1", info("release", &[("10.10", "10.10")])),
            ("4.0.2", info("release", &[("10.10", "10.10")])),
        ]);
        let status = get_update_status(
            "4.0.1",
            &versions,
            Channel::Release,
            Some("10.10"),
            LoginCapability::new_only(),
            None,
        );
        assert_eq!(
            status,
            Some((UpdateStatus::UpdateAvailable, "4.0.2".to_string()))
        );
    }

    #[test]
    fn incompatible_server_forces_a_downgrade() {
        let versions = catalog(&[
            ("4.0.1", info("release", &[("10.10", "10.10")])),
            ("4.0.2", info("release", &[("10.10", "10.10-HF50")])),
        ]);
        let status = get_update_status(
            "4.0.2",
            &versions,
            Channel::Release,
            Some("10.10-HF10"),
            LoginCapability::new_only(),
            None,
        );
        assert_eq!(
            status,
            Some((UpdateStatus::IncompatibleServer, "4.0.1".to_string()))
        );
    }

    #[test]
    fn dev_build_gets_no_proposal() {
        let versions = catalog(&[("4.0.2", info("release", &[("10.10", "10.10")]))]);
        let status = get_update_status(
            "4.0.3",
            &versions,
            Channel::Release,
            Some("10.10"),
            LoginCapability::new_only(),
            None,
        );
        assert_eq!(status, None);
    }

    #[test]
    fn wrong_channel_proposes_the_active_channel_build() {
        // An alpha build (four components) on the release channel, with no
        // newer release available.
        let versions = catalog(&[
            ("4.0.2.14", info("alpha", &[("10.10", "10.10")])),
            ("3.1.3", info("release", &[("10.10", "10.10")])),
        ]);
        let status = get_update_status(
            "4.0.2.13",
            &versions,
            Channel::Release,
            Some("10.10"),
            LoginCapability::new_only(),
            None,
        );
        assert_eq!(
            status,
            Some((UpdateStatus::WrongChannel, "3.1.3".to_string()))
        );
    }

    #[test]
    fn other_channel_build_still_updates_when_active_channel_is_newer() {
        let versions = catalog(&[
            ("4.0.2.13", info("alpha", &[("10.10", "10.10")])),
            ("4.1.0", info("release", &[("10.10", "10.10")])),
        ]);
        let status = get_update_status(
            "4.0.2.13",
            &versions,
            Channel::Release,
            Some("10.10"),
            LoginCapability::new_only(),
            None,
        );
        assert_eq!(
            status,
            Some((UpdateStatus::UpdateAvailable, "4.1.0".to_string()))
        );
    }

    #[test]
    fn beta_channel_accepts_release_builds_too() {
        let versions = catalog(&[
            ("4.0.2", info("release", &[("10.10", "10.10")])),
            ("4.1.0b1", info("beta", &[("10.10", "10.10")])),
        ]);
        let status = get_update_status(
            "4.0.2",
            &versions,
            Channel::Beta,
            Some("10.10"),
            LoginCapability::new_only(),
            None,
        );
        assert_eq!(
            status,
            Some((UpdateStatus::UpdateAvailable, "4.1.0b1".to_string()))
        );
    }

    #[test]
    fn old_login_servers_filter_out_new_clients() {
        let versions = catalog(&[
            ("3.1.3", info("release", &[("10.10", "10.10")])),
            ("4.0.2", info("release", &[("10.10", "10.10")])),
        ]);
        let status = get_update_status(
            "3.1.3",
            &versions,
            Channel::Release,
            Some("10.10"),
            LoginCapability::old_only(),
            None,
        );
        // 4.x is filtered; 3.1.3 stays the latest acceptable version.
        assert_eq!(status, Some((UpdateStatus::UpToDate, String::new())));
    }

    #[test]
    fn centralized_pin_overrides_channel_membership() {
        let versions = catalog(&[
            ("4.0.2", info("release", &[("10.10", "10.10")])),
            ("4.1.0b1", info("beta", &[("10.10", "10.10")])),
        ]);
        let status = get_update_status(
            "4.0.2",
            &versions,
            Channel::Centralized,
            Some("10.10"),
            LoginCapability::new_only(),
            Some("4.1.0b1"),
        );
        assert_eq!(
            status,
            Some((UpdateStatus::UpdateAvailable, "4.1.0b1".to_string()))
        );
    }

    #[test]
    fn centralized_without_pin_falls_back_to_release() {
        let versions = catalog(&[
            ("4.0.2", info("release", &[("10.10", "10.10")])),
            ("4.1.0b1", info("beta", &[("10.10", "10.10")])),
        ]);
        let status = get_update_status(
            "4.0.2",
            &versions,
            Channel::Centralized,
            Some("10.10"),
            LoginCapability::new_only(),
            None,
        );
        assert_eq!(status, Some((UpdateStatus::UpToDate, String::new())));
    }

    #[test]
    fn centralized_pin_missing_from_catalog() {
        let versions = catalog(&[("4.0.2", info("release", &[("10.10", "10.10")]))]);
        let status = get_update_status(
            "4.0.2",
            &versions,
            Channel::Centralized,
            Some("10.10"),
            LoginCapability::new_only(),
            Some("4.0.9"),
        );
        assert_eq!(
            status,
            Some((UpdateStatus::MissingVersion, "4.0.9".to_string()))
        );
    }

    #[test]
    fn server_outside_known_branches_is_incompatible() {
        let versions = catalog(&[("4.0.2", info("release", &[("10.10", "10.10")]))]);
        let status = get_update_status(
            "4.0.1.2.3",
            &versions,
            Channel::Release,
            Some("11.1"),
            LoginCapability::new_only(),
            None,
        );
        // No compatible candidate on the active channel at all.
        assert_eq!(status, None);
    }

    #[test]
    fn catalog_entry_parses_from_json() {
        let info: VersionInfo = serde_json::from_value(serde_json::json!({
            "type": "release",
            "min_all": { "10.10": "10.10-HF11" },
            "max_all": {},
            "checksum": { "algo": "sha256", "appimage": "deadbeef" }
        }))
        .unwrap();
        assert_eq!(info.channel(), Channel::Release);
        assert!(info.compatible_with(Some("10.10-HF20")));
        assert!(!info.compatible_with(Some("10.10-HF01")));
        assert!(!info.compatible_with(Some("9.10")));
        assert_eq!(info.checksum.unwrap().algo, "sha256");
    }
}
