use anyhow::Context;

pub(crate) const DEFAULT_PORT: u16 = 8080;
pub(crate) const DEFAULT_FPS: u32 = 30;
pub(crate) const DEFAULT_DISPLAY_NUM: &str = "99";
pub(crate) const DEFAULT_MAX_WIDTH: u32 = 3840;
pub(crate) const DEFAULT_MAX_HEIGHT: u32 = 2160;

pub(crate) struct Args {
    pub port: u16,
    pub fps: u32,
    pub display_num: String,
    pub webrtc_public_ip: Option<String>,
    pub test_pattern: bool,
    pub encoder_bin: String,
    pub injector_bin: String,
    pub public_dir: String,
    pub max_width: u32,
    pub max_height: u32,
}

/// Parse CLI flags, falling back to the environment variables named in each
/// arm. CLI args win when both are present; secrets aren't in play here so
/// unlike the capture agent's token handling, there's no env-over-CLI
/// precedence rule to enforce.
pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut port = env_or(DEFAULT_PORT, "PORT")?;
    let mut fps = env_or(DEFAULT_FPS, "FPS")?;
    let mut display_num = std::env::var("DISPLAY_NUM").unwrap_or_else(|_| DEFAULT_DISPLAY_NUM.to_string());
    let mut webrtc_public_ip = std::env::var("WEBRTC_PUBLIC_IP").ok();
    let mut test_pattern = std::env::var("TEST_PATTERN").is_ok();
    let mut encoder_bin = std::env::var("ENCODER_BIN").unwrap_or_else(|_| "screen-encoder".to_string());
    let mut injector_bin = std::env::var("INJECTOR_BIN").unwrap_or_else(|_| "xdotool".to_string());
    let mut public_dir = std::env::var("PUBLIC_DIR").unwrap_or_else(|_| "./public".to_string());
    let mut max_width = DEFAULT_MAX_WIDTH;
    let mut max_height = DEFAULT_MAX_HEIGHT;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("deskcast-server {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--port" | "-p" => {
                i += 1;
                port = args
                    .get(i)
                    .context("Missing --port value")?
                    .parse()
                    .context("Invalid --port value")?;
            }
            "--fps" => {
                i += 1;
                fps = args
                    .get(i)
                    .context("Missing --fps value")?
                    .parse()
                    .context("Invalid --fps value")?;
            }
            "--display-num" => {
                i += 1;
                display_num = args.get(i).context("Missing --display-num value")?.clone();
            }
            "--webrtc-public-ip" => {
                i += 1;
                webrtc_public_ip =
                    Some(args.get(i).context("Missing --webrtc-public-ip value")?.clone());
            }
            "--test-pattern" => {
                test_pattern = true;
            }
            "--encoder-bin" => {
                i += 1;
                encoder_bin = args.get(i).context("Missing --encoder-bin value")?.clone();
            }
            "--injector-bin" => {
                i += 1;
                injector_bin = args.get(i).context("Missing --injector-bin value")?.clone();
            }
            "--public-dir" => {
                i += 1;
                public_dir = args.get(i).context("Missing --public-dir value")?.clone();
            }
            "--max-width" => {
                i += 1;
                max_width = args
                    .get(i)
                    .context("Missing --max-width value")?
                    .parse()
                    .context("Invalid --max-width value")?;
            }
            "--max-height" => {
                i += 1;
                max_height = args
                    .get(i)
                    .context("Missing --max-height value")?
                    .parse()
                    .context("Invalid --max-height value")?;
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        port,
        fps,
        display_num,
        webrtc_public_ip,
        test_pattern,
        encoder_bin,
        injector_bin,
        public_dir,
        max_width,
        max_height,
    })
}

fn env_or<T: std::str::FromStr>(default: T, var: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {var}={v:?}: {e}")),
        Err(_) => Ok(default),
    }
}

fn print_usage() {
    println!("deskcast-server - single-port remote desktop server");
    println!();
    println!("USAGE:");
    println!("    deskcast-server [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>                  HTTP/WS listen port [env: PORT, default: 8080]");
    println!("    --fps <FPS>                     Capture/encode framerate [env: FPS, default: 30]");
    println!("    --display-num <N>               X display number [env: DISPLAY_NUM, default: 99]");
    println!("    --webrtc-public-ip <IP>          ICE host candidate override [env: WEBRTC_PUBLIC_IP]");
    println!("    --test-pattern                  Use a synthetic source instead of screen capture [env: TEST_PATTERN]");
    println!("    --encoder-bin <PATH>             Encoder binary name [env: ENCODER_BIN, default: screen-encoder]");
    println!("    --injector-bin <PATH>            Input injection tool [env: INJECTOR_BIN, default: xdotool]");
    println!("    --public-dir <PATH>              Static asset directory [env: PUBLIC_DIR, default: ./public]");
    println!("    --max-width <PIXELS>             Maximum resize width [default: 3840]");
    println!("    --max-height <PIXELS>            Maximum resize height [default: 2160]");
    println!("    -V, --version                    Print version and exit");
    println!("    -h, --help                       Print this help and exit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_default_when_unset() {
        std::env::remove_var("DESKCAST_TEST_VAR_UNSET");
        let v: u16 = env_or(1234, "DESKCAST_TEST_VAR_UNSET").unwrap();
        assert_eq!(v, 1234);
    }
}
