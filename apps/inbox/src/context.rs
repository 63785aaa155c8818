//! Signed-in user, permissions and theme tokens shared by the console views.

use std::collections::BTreeMap;

use backend_sdk::{AccountGateway, Profile, Session};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FooterLink {
    pub label: String,
    pub href: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footer {
    pub text: String,
    #[serde(default)]
    pub links: Vec<FooterLink>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Theme {
    pub brand_name: String,
    pub brand_short: String,
    pub logo_url: String,
    pub banner_url: String,
    pub banner_text: String,
    pub footer: Footer,
    pub colors: BTreeMap<String, String>,
}

impl Default for Theme {
    fn default() -> Self {
        let colors = [
            ("bg", "#ffffff"),
            ("panel", "#ffffff"),
            ("panel2", "#f8fafc"),
            ("text", "#0f172a"),
            ("muted", "#64748b"),
            ("brand", "#3b82f6"),
            ("accent", "#1e40af"),
            ("danger", "#dc2626"),
            ("success", "#10b981"),
            ("warning", "#f59e0b"),
            ("info", "#0ea5e9"),
            ("brandLight", "#60a5fa"),
            ("border", "#e2e8f0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            brand_name: "SestIA".into(),
            brand_short: "SestIA".into(),
            logo_url: "assets/logo.svg".into(),
            banner_url: "assets/banner.svg".into(),
            banner_text: "Sistema Modular de Gestión".into(),
            footer: Footer {
                text: "© 2025 SestIA. Todos los derechos reservados.".into(),
                links: Vec::new(),
            },
            colors,
        }
    }
}

impl Theme {
    pub fn color(&self, key: &str) -> Option<&str> {
        self.colors.get(key).map(String::as_str)
    }

    /// Light brand tone, falling back to the brand color.
    pub fn brand_light(&self) -> &str {
        self.color("brandLight")
            .or_else(|| self.color("brand"))
            .unwrap_or("#60a5fa")
    }

    /// Applies a stored theme document. Top-level keys replace defaults;
    /// `colors` and `footer` merge key by key. Malformed documents are ignored.
    pub fn merge_overrides(&mut self, overrides: Value) {
        let Value::Object(overrides) = overrides else {
            warn!(target: "inbox::context", "theme document is not an object; keeping defaults");
            return;
        };
        let mut merged = match serde_json::to_value(&*self) {
            Ok(Value::Object(map)) => map,
            _ => return,
        };
        for (key, value) in overrides {
            match value {
                Value::Null => {}
                Value::Object(patch) if matches!(merged.get(&key), Some(Value::Object(_))) => {
                    if let Some(Value::Object(base)) = merged.get_mut(&key) {
                        base.extend(patch);
                    }
                }
                value => {
                    merged.insert(key, value);
                }
            }
        }
        match serde_json::from_value(Value::Object(merged)) {
            Ok(theme) => *self = theme,
            Err(err) => {
                warn!(target: "inbox::context", error = %err, "ignoring malformed theme document");
            }
        }
    }
}

/// Route guard attached to a console module.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModuleAccess {
    pub public: bool,
    pub roles: Vec<String>,
    pub perms: Vec<String>,
}

impl ModuleAccess {
    pub fn public() -> Self {
        Self {
            public: true,
            ..Self::default()
        }
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn perms<I, S>(mut self, perms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.perms = perms.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppContext {
    pub session: Option<Session>,
    pub profile: Option<Profile>,
    pub permissions: Vec<String>,
    pub theme: Theme,
}

impl AppContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Loads profile, permissions and theme for a session. Each piece
    /// degrades independently when the backend call fails.
    pub async fn load(gateway: &dyn AccountGateway, session: Option<Session>) -> Self {
        let mut context = Self {
            session,
            ..Self::default()
        };

        match gateway.theme_overrides().await {
            Ok(Some(doc)) => context.theme.merge_overrides(doc),
            Ok(None) => debug!(target: "inbox::context", "no stored theme; using defaults"),
            Err(err) => warn!(target: "inbox::context", error = %err, "theme load failed"),
        }

        let Some(user_id) = context.user_id().map(str::to_string) else {
            return context;
        };
        match gateway.profile_for(&user_id).await {
            Ok(profile) => context.profile = profile,
            Err(err) => warn!(target: "inbox::context", user = %user_id, error = %err, "profile load failed"),
        }
        match gateway.permissions_for(&user_id).await {
            Ok(perms) => context.permissions = perms,
            Err(err) => warn!(target: "inbox::context", user = %user_id, error = %err, "permission load failed"),
        }
        debug!(
            target: "inbox::context",
            user = %user_id,
            role = ?context.role(),
            permissions = context.permissions.len(),
            "context loaded"
        );
        context
    }

    pub fn user_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user.id.as_str())
    }

    pub fn is_signed_in(&self) -> bool {
        self.session.is_some()
    }

    pub fn role(&self) -> Option<&str> {
        self.profile.as_ref().and_then(|p| p.role.as_deref())
    }

    pub fn can<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        if roles.is_empty() {
            return true;
        }
        match self.role() {
            Some(role) => roles.iter().any(|r| r.as_ref() == role),
            None => false,
        }
    }

    pub fn has_perm<S: AsRef<str>>(&self, required: &[S]) -> bool {
        if required.is_empty() {
            return true;
        }
        if self.permissions.is_empty() {
            return false;
        }
        required
            .iter()
            .all(|key| self.permissions.iter().any(|p| p == key.as_ref()))
    }

    pub fn can_open(&self, access: &ModuleAccess) -> bool {
        if access.public {
            return true;
        }
        self.is_signed_in() && self.can(&access.roles) && self.has_perm(&access.perms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend_sdk::{AuthUser, InMemoryBackend};
    use serde_json::json;

    fn session(user: &str) -> Session {
        Session {
            access_token: "token".into(),
            refresh_token: None,
            expires_in: None,
            user: AuthUser {
                id: user.into(),
                email: None,
            },
        }
    }

    fn profile(user: &str, role: &str) -> Profile {
        Profile {
            user_id: user.into(),
            email: None,
            role: Some(role.into()),
            name: None,
        }
    }

    #[test]
    fn theme_overrides_merge_colors_key_by_key() {
        let mut theme = Theme::default();
        theme.merge_overrides(json!({
            "brandName": "Acme",
            "colors": { "brand": "#ff0000" },
            "footer": { "text": "© Acme" }
        }));
        assert_eq!(theme.brand_name, "Acme");
        assert_eq!(theme.brand_short, "SestIA");
        assert_eq!(theme.color("brand"), Some("#ff0000"));
        assert_eq!(theme.color("accent"), Some("#1e40af"));
        assert_eq!(theme.footer.text, "© Acme");
    }

    #[test]
    fn malformed_theme_keeps_defaults() {
        let mut theme = Theme::default();
        theme.merge_overrides(json!(["not", "an", "object"]));
        theme.merge_overrides(json!({ "colors": { "brand": 7 } }));
        assert_eq!(theme, Theme::default());
    }

    #[test]
    fn brand_light_falls_back_to_brand() {
        let mut theme = Theme::default();
        theme.colors.remove("brandLight");
        assert_eq!(theme.brand_light(), "#3b82f6");
        theme.colors.clear();
        assert_eq!(theme.brand_light(), "#60a5fa");
    }

    #[test]
    fn role_and_permission_guards() {
        let mut context = AppContext::anonymous();
        assert!(context.can::<&str>(&[]));
        assert!(!context.can(&["admin"]));
        assert!(context.has_perm::<&str>(&[]));
        assert!(!context.has_perm(&["livechat.view"]));

        context.profile = Some(profile("u-1", "agent"));
        context.permissions = vec!["livechat.view".into(), "livechat.reply".into()];
        assert!(context.can(&["admin", "agent"]));
        assert!(context.has_perm(&["livechat.view", "livechat.reply"]));
        assert!(!context.has_perm(&["livechat.view", "users.manage"]));
    }

    #[test]
    fn modules_require_a_session_unless_public() {
        let livechat = ModuleAccess::default().roles(["agent"]).perms(["livechat.view"]);
        let mut context = AppContext {
            profile: Some(profile("u-1", "agent")),
            permissions: vec!["livechat.view".into()],
            ..AppContext::default()
        };
        assert!(!context.can_open(&livechat));
        assert!(context.can_open(&ModuleAccess::public()));

        context.session = Some(session("u-1"));
        assert!(context.can_open(&livechat));
        assert!(!context.can_open(&ModuleAccess::default().roles(["admin"])));
    }

    #[tokio::test]
    async fn loads_profile_permissions_and_theme() {
        let backend = InMemoryBackend::new();
        backend
            .add_account(
                "ana@example.com",
                "secret",
                "u-1",
                Some(profile("u-1", "admin")),
                vec!["livechat.view".into()],
            )
            .await;
        backend.set_theme(json!({ "colors": { "accent": "#000000" } })).await;

        let context = AppContext::load(backend.as_ref(), Some(session("u-1"))).await;
        assert_eq!(context.role(), Some("admin"));
        assert_eq!(context.permissions, vec!["livechat.view".to_string()]);
        assert_eq!(context.theme.color("accent"), Some("#000000"));

        let anonymous = AppContext::load(backend.as_ref(), None).await;
        assert!(anonymous.profile.is_none());
        assert!(anonymous.permissions.is_empty());
        assert_eq!(anonymous.theme.color("accent"), Some("#000000"));
    }
}
