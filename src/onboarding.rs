//! First-login provisioning.
//!
//! A freshly registered user gets a library row, a preferences row, and a
//! profile row linking both, all permissioned to that user. Safe to call
//! more than once: an existing profile short-circuits without writes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::backend::{PreferencesDoc, ProfileDoc, RemoteBackend};

/// The registered user being provisioned.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub user_id: String,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct OnboardingReport {
    pub already_onboarded: bool,
    pub username: Option<String>,
    pub library_id: Option<String>,
    pub profile_id: Option<String>,
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// `{email local part}_{base-36 timestamp}` — unique enough without a
/// round-trip to check for collisions.
pub fn generate_username(email: &str, now: DateTime<Utc>) -> String {
    let base = email.split('@').next().unwrap_or(email);
    let stamp = base36(now.timestamp_millis().max(0) as u64);
    format!("{}_{}", base, stamp)
}

/// Deterministic avatar URL derived from the user's name.
pub fn avatar_url(name: &str) -> String {
    format!(
        "https://api.dicebear.com/9.x/fun-emoji/svg?seed={}",
        urlencoding::encode(name)
    )
}

pub async fn onboard_user(
    backend: &dyn RemoteBackend,
    user: &NewUser,
    now: DateTime<Utc>,
) -> Result<OnboardingReport> {
    if backend
        .get_profile(&user.user_id)
        .await
        .context("failed to check for existing profile")?
        .is_some()
    {
        tracing::info!("User already onboarded: {}", user.email);
        return Ok(OnboardingReport {
            already_onboarded: true,
            ..OnboardingReport::default()
        });
    }

    tracing::info!("Onboarding user: {}", user.email);

    let library_id = backend
        .create_library(&user.user_id)
        .await
        .context("failed to create library")?;

    let preferences_id = backend
        .create_preferences(&user.user_id, &PreferencesDoc::default())
        .await
        .context("failed to create preferences")?;

    let username = generate_username(&user.email, now);
    let profile = ProfileDoc {
        user_id: user.user_id.clone(),
        name: user.name.clone(),
        email: user.email.clone(),
        username: username.clone(),
        avatar_url: avatar_url(&user.name),
        media_preference: "both".to_string(),
        library: library_id.clone(),
        preferences: preferences_id,
    };
    let profile_id = backend
        .create_profile(&user.user_id, &profile)
        .await
        .context("failed to create profile")?;

    tracing::info!("User onboarded successfully: {}", user.email);
    Ok(OnboardingReport {
        already_onboarded: false,
        username: Some(username),
        library_id: Some(library_id),
        profile_id: Some(profile_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn new_user() -> NewUser {
        NewUser {
            user_id: "user-1".to_string(),
            email: "ada.lovelace@example.com".to_string(),
            name: "Ada Lovelace".to_string(),
        }
    }

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(36 * 36 + 1), "101");
    }

    #[test]
    fn test_username_from_email_local_part() {
        let now = Utc::now();
        let username = generate_username("ada.lovelace@example.com", now);
        assert!(username.starts_with("ada.lovelace_"));
        let stamp = username.rsplit('_').next().unwrap();
        assert!(!stamp.is_empty());
        assert!(stamp.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_avatar_url_escapes_seed() {
        let url = avatar_url("Ada Lovelace");
        assert_eq!(
            url,
            "https://api.dicebear.com/9.x/fun-emoji/svg?seed=Ada%20Lovelace"
        );
    }

    #[tokio::test]
    async fn test_onboarding_creates_all_rows() {
        let backend = MemoryBackend::new();
        let report = onboard_user(&backend, &new_user(), Utc::now())
            .await
            .unwrap();

        assert!(!report.already_onboarded);
        assert!(report.username.is_some());
        assert!(report.profile_id.is_some());
        assert_eq!(backend.profile_count(), 1);

        let profile = backend.get_profile("user-1").await.unwrap().unwrap();
        assert_eq!(profile.email, "ada.lovelace@example.com");
        assert_eq!(profile.media_preference, "both");
        assert_eq!(profile.library, report.library_id.unwrap());

        // The library is the same one the sync path would pick up
        let found = backend.find_library("user-1").await.unwrap();
        assert_eq!(found.as_deref(), Some(profile.library.as_str()));
    }

    #[tokio::test]
    async fn test_onboarding_is_idempotent() {
        let backend = MemoryBackend::new();
        onboard_user(&backend, &new_user(), Utc::now())
            .await
            .unwrap();

        let report = onboard_user(&backend, &new_user(), Utc::now())
            .await
            .unwrap();
        assert!(report.already_onboarded);
        assert!(report.username.is_none());
        assert_eq!(backend.profile_count(), 1);
    }

    #[tokio::test]
    async fn test_onboarding_propagates_write_failures() {
        let backend = MemoryBackend::new();
        backend.set_fail_writes(true);

        let err = onboard_user(&backend, &new_user(), Utc::now())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("failed to create library"));
        assert_eq!(backend.profile_count(), 0);
    }
}
