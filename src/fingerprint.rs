//! Desktop browser identity applied to every new session.

use crate::config::Viewport;
use rand::seq::SliceRandom;
use rand::Rng;

pub const DESKTOP_USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36 Edg/123.0.0.0",
];

const DESKTOP_VIEWPORTS: [(u32, u32); 4] = [(1920, 1080), (1366, 768), (1536, 864), (1440, 900)];

const TIMEZONES: [&str; 3] = ["America/New_York", "Europe/London", "Asia/Singapore"];

/// Hides the usual automation markers before any page script runs.
pub const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
window.chrome = window.chrome || { runtime: {} };
const originalQuery = window.navigator.permissions && window.navigator.permissions.query;
if (originalQuery) {
  window.navigator.permissions.query = (parameters) =>
    parameters.name === 'notifications'
      ? Promise.resolve({ state: Notification.permission })
      : originalQuery(parameters);
}
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub user_agent: String,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub device_scale_factor: f64,
    pub timezone: String,
}

impl Fingerprint {
    /// Builds a fingerprint from config. A configured user agent wins over
    /// the random pick; the viewport is random only when requested.
    pub fn for_session(viewport: &Viewport, user_agent: Option<&str>) -> Self {
        let mut rng = rand::thread_rng();

        let user_agent = user_agent
            .map(str::to_string)
            .unwrap_or_else(|| random_user_agent(&DESKTOP_USER_AGENTS));

        let (width, height) = if viewport.randomize {
            DESKTOP_VIEWPORTS[rng.gen_range(0..DESKTOP_VIEWPORTS.len())]
        } else {
            (viewport.width, viewport.height)
        };

        Self {
            user_agent,
            viewport_width: width,
            viewport_height: height,
            device_scale_factor: viewport.device_scale_factor,
            timezone: TIMEZONES[rng.gen_range(0..TIMEZONES.len())].to_string(),
        }
    }
}

pub fn random_user_agent<S: AsRef<str>>(candidates: &[S]) -> String {
    candidates
        .choose(&mut rand::thread_rng())
        .map(|ua| ua.as_ref().to_string())
        .unwrap_or_else(|| DESKTOP_USER_AGENTS[0].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_user_agent_wins() {
        let fp = Fingerprint::for_session(&Viewport::default(), Some("Custom/1.0"));
        assert_eq!(fp.user_agent, "Custom/1.0");
        assert_eq!((fp.viewport_width, fp.viewport_height), (1920, 1080));
    }

    #[test]
    fn test_randomized_fingerprint_is_desktop() {
        let viewport = Viewport {
            randomize: true,
            ..Default::default()
        };
        for _ in 0..20 {
            let fp = Fingerprint::for_session(&viewport, None);
            assert!(DESKTOP_USER_AGENTS.contains(&fp.user_agent.as_str()));
            assert!(DESKTOP_VIEWPORTS.contains(&(fp.viewport_width, fp.viewport_height)));
            assert!(!fp.timezone.is_empty());
        }
    }

    #[test]
    fn test_random_user_agent_empty_list_falls_back() {
        let empty: [&str; 0] = [];
        assert_eq!(random_user_agent(&empty), DESKTOP_USER_AGENTS[0]);
    }
}
