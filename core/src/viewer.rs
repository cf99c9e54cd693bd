/// Browser viewer URLs for a session's web proxy.
///
/// Toggling view-only mode is a pure rewrite of the URL the client already
/// holds; no server state changes.
use crate::errors::ViewerError;
use serde::{Deserialize, Serialize};
use url::Url;

const VIEW_ONLY: &str = "view_only";
const VIEWER_PAGE: &str = "vnc.html";

/// Parameters of the embedded remote-desktop viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerUrl {
    pub host: String,
    pub web_port: u16,
    pub path: String,
    pub resize: String,
    pub autoconnect: bool,
    pub reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub view_only: bool,
}

impl ViewerUrl {
    pub fn new(host: impl Into<String>, web_port: u16) -> Self {
        Self {
            host: host.into(),
            web_port,
            path: String::new(),
            resize: "scale".to_string(),
            autoconnect: true,
            reconnect: true,
            reconnect_delay_ms: 2000,
            view_only: false,
        }
    }

    pub fn view_only(mut self, view_only: bool) -> Self {
        self.view_only = view_only;
        self
    }

    pub fn to_url(&self) -> Result<Url, ViewerError> {
        let mut url = Url::parse(&format!("http://{}:{}/", self.host, self.web_port))?;
        url.set_path(VIEWER_PAGE);
        url.query_pairs_mut()
            .append_pair("path", &self.path)
            .append_pair("resize", &self.resize)
            .append_pair("autoconnect", &self.autoconnect.to_string())
            .append_pair("reconnect", &self.reconnect.to_string())
            .append_pair("reconnect_delay", &self.reconnect_delay_ms.to_string())
            .append_pair(VIEW_ONLY, &self.view_only.to_string());
        Ok(url)
    }

    pub fn render(&self) -> Result<String, ViewerError> {
        self.to_url().map(String::from)
    }
}

/// Set the `view_only` query parameter of an existing viewer URL.
///
/// Every other parameter keeps its position and value.
pub fn set_view_only(raw: &str, view_only: bool) -> Result<String, ViewerError> {
    let mut url = Url::parse(raw)?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != VIEW_ONLY)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(VIEW_ONLY, &view_only.to_string());
    Ok(url.into())
}

/// Current `view_only` value of a viewer URL; absent means interactive.
pub fn is_view_only(raw: &str) -> Result<bool, ViewerError> {
    let url = Url::parse(raw)?;
    let view_only = url
        .query_pairs()
        .any(|(key, value)| key == VIEW_ONLY && value == "true");
    Ok(view_only)
}

/// Flip view-only mode on a viewer URL. Returns the new URL and mode.
pub fn toggle_view_only(raw: &str) -> Result<(String, bool), ViewerError> {
    let view_only = !is_view_only(raw)?;
    Ok((set_view_only(raw, view_only)?, view_only))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_viewer_url() {
        assert_eq!(
            ViewerUrl::new("localhost", 6080).render().unwrap(),
            "http://localhost:6080/vnc.html?path=&resize=scale&autoconnect=true&reconnect=true&reconnect_delay=2000&view_only=false"
        );
    }

    #[test]
    fn test_path_with_reserved_characters_is_encoded() {
        let mut viewer = ViewerUrl::new("desk.local", 6081);
        viewer.path = "websockify?token=a&b".to_string();
        let rendered = viewer.render().unwrap();
        assert!(rendered.contains("path=websockify%3Ftoken%3Da%26b&resize=scale"));

        let url = Url::parse(&rendered).unwrap();
        let path = url
            .query_pairs()
            .find(|(key, _)| key == "path")
            .map(|(_, value)| value.into_owned());
        assert_eq!(path.as_deref(), Some("websockify?token=a&b"));
        assert_eq!(url.query_pairs().count(), 6);
    }

    #[test]
    fn test_toggle_round_trips() {
        let url = ViewerUrl::new("10.0.0.5", 6081).render().unwrap();
        let (locked, view_only) = toggle_view_only(&url).unwrap();
        assert!(view_only);
        assert!(is_view_only(&locked).unwrap());
        assert!(locked.ends_with("view_only=true"));
        assert!(locked.starts_with("http://10.0.0.5:6081/vnc.html?path=&resize=scale"));

        let (unlocked, view_only) = toggle_view_only(&locked).unwrap();
        assert!(!view_only);
        assert_eq!(unlocked, url);
    }

    #[test]
    fn test_toggle_adds_missing_parameter() {
        let (toggled, _) = toggle_view_only("http://h:6080/vnc.html?autoconnect=true#top").unwrap();
        assert_eq!(toggled, "http://h:6080/vnc.html?autoconnect=true&view_only=true#top");
        assert!(!is_view_only("http://h:6080/vnc.html").unwrap());
    }

    #[test]
    fn test_percent_encoded_key_is_recognized() {
        assert!(is_view_only("http://h:6080/vnc.html?view%5Fonly=true").unwrap());

        let (toggled, view_only) =
            toggle_view_only("http://h:6080/vnc.html?view%5Fonly=true&resize=scale").unwrap();
        assert!(!view_only);
        assert_eq!(toggled, "http://h:6080/vnc.html?resize=scale&view_only=false");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(matches!(
            toggle_view_only("not a url"),
            Err(ViewerError::InvalidUrl(_))
        ));
        assert!(ViewerUrl::new("bad host", 6080).render().is_err());
    }
}
