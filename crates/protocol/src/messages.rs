use serde::{Deserialize, Serialize};

/// Messages the browser sends on the control WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        timestamp: f64,
    },
    Keydown {
        key: String,
    },
    Keyup {
        key: String,
    },
    Mousemove {
        x: f64,
        y: f64,
    },
    Mousedown {
        button: u8,
    },
    Mouseup {
        button: u8,
    },
    Spawn {
        command: String,
    },
    Config {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bandwidth: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quality: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        framerate: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vbr: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cpu_effort: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cpu_threads: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enable_desktop_mouse: Option<bool>,
    },
    Resize {
        width: u32,
        height: u32,
    },
    WebrtcOffer {
        sdp: SessionDescription,
    },
    WebrtcIce {
        candidate: serde_json::Value,
    },
    WebrtcReady,
}

/// Messages the server sends on the control WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Pong { timestamp: f64 },
    WebrtcAnswer { sdp: SessionDescription },
    WebrtcIce { candidate: serde_json::Value },
    Error { message: String },
}

/// Minimal SDP envelope, mirroring the shape the browser's RTCSessionDescription
/// serializes to (`{type: "offer"|"answer", sdp: "..."}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// Programs the `spawn` message is allowed to launch. Anything else is
/// silently rejected.
pub const SPAWN_ALLOW_LIST: &[&str] = &[
    "gnome-calculator",
    "weston-terminal",
    "gedit",
    "mousepad",
    "xclock",
    "xeyes",
    "xfce4-terminal",
];

pub fn is_spawn_allowed(command: &str) -> bool {
    SPAWN_ALLOW_LIST.contains(&command)
}
