//! SSO login, session restore, and profile discovery/selection.
//!
//! The portal delegates authentication to a Keycloak SSO host. Login means
//! following the redirect chain to the SSO form, posting credentials, and
//! then probing the portal's `currentUser` endpoint to confirm the session
//! took. Profiles live on a server-rendered JSF page and are selected by
//! replaying the row-click form post.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use regex::Regex;
use tracing::{debug, error, info, warn};

use pje_core::scrape::{decode_html_entities, extract_viewstate, find_best_match};
use pje_core::{AuthenticatedUser, Profile, SessionClient, SessionStore};

use crate::pace_short;

const PROFILE_PAGE: &str = "/pje/ng2/dev.seam";
const MAX_PROFILE_PAGES: u32 = 20;

pub struct AuthService {
    client: Arc<SessionClient>,
    store: SessionStore,
    corrupted: AtomicBool,
    profiles: Mutex<Vec<Profile>>,
}

impl AuthService {
    pub fn new(client: Arc<SessionClient>, store: SessionStore) -> Self {
        Self {
            client,
            store,
            corrupted: AtomicBool::new(false),
            profiles: Mutex::new(Vec::new()),
        }
    }

    pub fn user(&self) -> Option<AuthenticatedUser> {
        self.client.user()
    }

    pub fn session_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Relaxed)
    }

    fn mark_corrupted(&self) {
        self.corrupted.store(true, Ordering::Relaxed);
        warn!("session marked as corrupted");
    }

    // ── Liveness ───────────────────────────────────────────────────────────

    /// Ask the portal who we are. Refreshes the cached user on success.
    pub async fn probe_session(&self) -> bool {
        match self.client.api_get("usuario/currentUser").await {
            Ok(resp) if resp.ok() => {
                match serde_json::from_str::<AuthenticatedUser>(&resp.body) {
                    Ok(user) if user.id > 0 => {
                        debug!(user = %user.name, "session probe ok");
                        self.client.set_user(Some(user));
                        true
                    }
                    _ => false,
                }
            }
            Ok(resp) => {
                debug!(status = %resp.status, "session probe rejected");
                false
            }
            Err(err) => {
                debug!(%err, "session probe failed");
                false
            }
        }
    }

    /// Restore a saved session: fresh on disk AND the live probe passes.
    pub async fn restore_session(&self) -> bool {
        if !self.store.is_fresh(self.client.config().session_max_age_hours) {
            return false;
        }
        let Some(cookies) = self.store.load() else {
            return false;
        };
        self.client.set_cookies(cookies);
        if self.probe_session().await {
            if let Some(user) = self.client.user() {
                info!(user = %user.name, "session restored");
            }
            return true;
        }
        false
    }

    // ── Login ──────────────────────────────────────────────────────────────

    /// SSO login. Without `force`, an already-live or restorable session is
    /// reused. Expected failures come back as `false`, not errors.
    pub async fn login(&self, username: &str, password: &str, force: bool) -> bool {
        if !force {
            if self.probe_session().await {
                if let Some(user) = self.client.user() {
                    info!(user = %user.name, "already logged in");
                }
                return true;
            }
            if self.restore_session().await {
                return true;
            }
        } else {
            self.store.clear();
        }

        info!(username, "starting SSO login");
        self.client.clear_session();

        let config = self.client.config().clone();
        let login_url = format!("{}/pje/login.seam", config.base_url);
        let page = match self.client.get(&login_url).await {
            Ok(page) => page,
            Err(err) => {
                error!(%err, "login page unreachable");
                return false;
            }
        };

        if !page.final_url.as_str().contains("sso.cloud.pje.jus.br") {
            error!(landed = %page.final_url, "login did not redirect to SSO");
            return false;
        }

        let Some(auth_url) = extract_sso_action(&page.body, &config.sso_url) else {
            error!("SSO form action not found");
            return false;
        };

        pace_short().await;

        let form = vec![
            ("username".to_string(), username.to_string()),
            ("password".to_string(), password.to_string()),
            ("credentialId".to_string(), String::new()),
        ];
        if let Err(err) = self.client.post_form(&auth_url, &form).await {
            error!(%err, "posting SSO credentials failed");
            return false;
        }

        pace_short().await;

        if self.probe_session().await {
            if let Some(user) = self.client.user() {
                info!(user = %user.name, "login ok");
            }
            if let Err(err) = self.store.save(&self.client.cookies()) {
                warn!(%err, "could not persist session");
            }
            self.corrupted.store(false, Ordering::Relaxed);
            true
        } else {
            error!("post-login session probe failed");
            false
        }
    }

    /// Drop everything: cookies, saved session, cached profiles, flags.
    pub fn reset_session(&self) {
        warn!("forcing full session reset");
        self.client.clear_session();
        self.store.clear();
        profiles_lock(&self.profiles).clear();
        self.corrupted.store(false, Ordering::Relaxed);
    }

    // ── Profiles ───────────────────────────────────────────────────────────

    /// List the user's access profiles, following the table paginator.
    /// Empty on any failure.
    pub async fn list_profiles(&self) -> Vec<Profile> {
        let url = format!("{}{PROFILE_PAGE}", self.client.config().base_url);
        let page = match self.client.get(&url).await {
            Ok(page) if page.status.is_success() => page,
            Ok(page) => {
                error!(status = %page.status, "profile page rejected");
                self.mark_corrupted();
                return Vec::new();
            }
            Err(err) => {
                error!(%err, "profile page unreachable");
                return Vec::new();
            }
        };

        let mut html = page.body;
        let mut all: Vec<Profile> = Vec::new();
        absorb_profiles(&mut all, extract_profiles(&html));
        info!(count = all.len(), "profiles on first page");

        if has_visible_paginator(&html) {
            let total_pages = paginator_page_count(&html).min(MAX_PROFILE_PAGES);
            for page_no in 2..=total_pages {
                pace_short().await;
                let Some(next_html) = self.fetch_profile_page(page_no, &html).await else {
                    break;
                };
                let found = extract_profiles(&next_html);
                if found.is_empty() {
                    break;
                }
                let before = all.len();
                absorb_profiles(&mut all, found);
                if all.len() == before {
                    break;
                }
                html = next_html;
            }
        }

        if all.is_empty() {
            warn!("no profiles found");
            self.mark_corrupted();
        }
        *profiles_lock(&self.profiles) = all.clone();
        all
    }

    async fn fetch_profile_page(&self, page_no: u32, previous_html: &str) -> Option<String> {
        let viewstate = extract_viewstate(previous_html).unwrap_or_else(|| "j_id1".to_string());
        let form_id = Regex::new(r#"id="([^"]*):scPerfil""#)
            .ok()?
            .captures(previous_html)?
            .get(1)?
            .as_str()
            .to_string();
        let scroller = format!("{form_id}:scPerfil");

        let form = vec![
            ("AJAXREQUEST".to_string(), "_viewRoot".to_string()),
            (form_id.clone(), form_id),
            (scroller.clone(), page_no.to_string()),
            ("ajaxSingle".to_string(), scroller),
            ("javax.faces.ViewState".to_string(), viewstate),
        ];
        let url = format!("{}{PROFILE_PAGE}", self.client.config().base_url);
        match self.client.post_form(&url, &form).await {
            Ok(resp) if resp.status.is_success() => Some(resp.body),
            Ok(resp) => {
                warn!(status = %resp.status, page_no, "profile pagination rejected");
                None
            }
            Err(err) => {
                error!(%err, page_no, "profile pagination failed");
                None
            }
        }
    }

    /// Select a profile by table row index (-1 is the favourite in the
    /// header). Re-probes and persists the session on success.
    pub async fn select_profile_by_index(&self, index: i32) -> bool {
        let url = format!("{}{PROFILE_PAGE}", self.client.config().base_url);
        let page = match self.client.get(&url).await {
            Ok(page) => page,
            Err(err) => {
                error!(%err, "profile page unreachable");
                return false;
            }
        };
        let viewstate = extract_viewstate(&page.body).unwrap_or_else(|| "j_id1".to_string());

        pace_short().await;

        let element_id = if index == -1 {
            "papeisUsuarioForm:dtPerfil:j_id66".to_string()
        } else {
            format!("papeisUsuarioForm:dtPerfil:{index}:j_id70")
        };
        let form = vec![
            ("papeisUsuarioForm".to_string(), "papeisUsuarioForm".to_string()),
            ("papeisUsuarioForm:j_id60".to_string(), String::new()),
            (
                "papeisUsuarioForm:j_id72".to_string(),
                "papeisUsuarioForm:j_id72".to_string(),
            ),
            ("javax.faces.ViewState".to_string(), viewstate),
            (element_id.clone(), element_id),
        ];
        if let Err(err) = self.client.post_form(&url, &form).await {
            error!(%err, "profile selection post failed");
            return false;
        }

        pace_short().await;

        if self.probe_session().await {
            if let Some(user) = self.client.user() {
                info!(user = %user.name, "profile selected");
            }
            if let Err(err) = self.store.save(&self.client.cookies()) {
                warn!(%err, "could not persist session after profile switch");
            }
            true
        } else {
            false
        }
    }

    /// Select by display name: exact, then substring, then similarity.
    pub async fn select_profile(&self, name: &str) -> bool {
        let mut profiles = profiles_lock(&self.profiles).clone();
        if profiles.is_empty() {
            profiles = self.list_profiles().await;
        }
        let names: Vec<String> = profiles.iter().map(Profile::full_name).collect();
        match find_best_match(name, &names, 0.4) {
            Some(idx) => {
                info!(profile = %names[idx], "profile matched");
                self.select_profile_by_index(profiles[idx].index).await
            }
            None => {
                error!(name, "profile not found");
                false
            }
        }
    }
}

fn profiles_lock(profiles: &Mutex<Vec<Profile>>) -> std::sync::MutexGuard<'_, Vec<Profile>> {
    match profiles.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Page scraping ──────────────────────────────────────────────────────────

fn extract_sso_action(html: &str, sso_url: &str) -> Option<String> {
    let re = Regex::new(r#"action="([^"]*)""#).ok()?;
    let action = re.captures(html)?.get(1)?.as_str().replace("&amp;", "&");
    if action.starts_with("http") {
        Some(action)
    } else {
        Some(format!("{sso_url}{action}"))
    }
}

fn profile_from_name(index: i32, raw_name: &str) -> Profile {
    let decoded = decode_html_entities(raw_name);
    let mut parts = decoded.split(" / ").map(str::trim);
    Profile {
        index,
        name: parts.next().unwrap_or(&decoded).to_string(),
        organ: parts.next().unwrap_or("").to_string(),
        role: parts.next().unwrap_or("").to_string(),
    }
}

/// The favourite profile is rendered in the table header, outside the rows,
/// and selected with a dedicated header control (index -1).
fn extract_favourite_profile(html: &str) -> Option<Profile> {
    let thead_re = Regex::new(r#"(?is)<thead[^>]*class="rich-table-thead"[^>]*>.*?</thead>"#).ok()?;
    let thead = thead_re.find(html)?.as_str();
    if !thead.contains("favorite-16x16.png") || thead.contains("favorite-16x16-disabled.png") {
        return None;
    }
    let name_re = Regex::new(r"(?i)dtPerfil:j_id66[^>]*>([^<]+)</a>").ok()?;
    let name = name_re.captures(thead)?.get(1)?.as_str();
    Some(profile_from_name(-1, name))
}

fn extract_profiles(html: &str) -> Vec<Profile> {
    let mut profiles = Vec::new();
    if let Some(favourite) = extract_favourite_profile(html) {
        profiles.push(favourite);
    }

    let primary = Regex::new(r"(?i)dtPerfil:(\d+):j_id70'[^>]*>([^<]+)</a>");
    let fallback =
        Regex::new(r#"(?i)<a[^>]*onclick="[^"]*dtPerfil:(\d+)[^"]*j_id70[^"]*"[^>]*>([^<]+)</a>"#);

    for re in [primary, fallback].into_iter().flatten() {
        let matched: Vec<_> = re.captures_iter(html).collect();
        if matched.is_empty() {
            continue;
        }
        for caps in matched {
            if let (Some(idx), Some(name)) = (caps.get(1), caps.get(2)) {
                if let Ok(index) = idx.as_str().parse() {
                    profiles.push(profile_from_name(index, name.as_str()));
                }
            }
        }
        break;
    }
    profiles
}

fn absorb_profiles(all: &mut Vec<Profile>, found: Vec<Profile>) {
    for profile in found {
        let key = profile.full_name().to_lowercase();
        let duplicate = all
            .iter()
            .any(|p| p.index == profile.index || p.full_name().to_lowercase() == key);
        if !duplicate {
            all.push(profile);
        }
    }
}

fn has_visible_paginator(html: &str) -> bool {
    let Ok(re) = Regex::new(r#"id="[^"]*scPerfil"[^>]*style="[^"]*""#) else {
        return false;
    };
    match re.find(html) {
        Some(m) => {
            let tag = m.as_str();
            !tag.contains("display: none") && !tag.contains("display:none")
        }
        None => false,
    }
}

fn paginator_page_count(html: &str) -> u32 {
    let Ok(re) = Regex::new(r"rich-datascr-(?:inact|act)[^>]*>(\d+)<") else {
        return 1;
    };
    re.captures_iter(html)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .max()
        .unwrap_or(1)
}

// ── Tests ──────────────────────────────────────────────────────────────────
