use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    session: Session,
    audio: Audio,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    model: String,
    #[serde(default)]
    api_key: String,
    close_timeout_ms: u64,
}

#[derive(Deserialize)]
struct Session {
    system_prompt: String,
    voice_name: String,
    input_transcription: bool,
    output_transcription: bool,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    capture_sample_rate: u32,
    playback_sample_rate: u32,
    capture_frame_size: usize,
    playback_period_size: usize,
}

// rustc-env 的值不能跨行
fn one_line(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=LIVE_MODEL={}", config.network.model);
    println!("cargo:rustc-env=LIVE_API_KEY={}", config.network.api_key);
    println!("cargo:rustc-env=CLOSE_TIMEOUT_MS={}", config.network.close_timeout_ms);

    // 会话配置
    println!("cargo:rustc-env=SYSTEM_PROMPT={}", one_line(&config.session.system_prompt));
    println!("cargo:rustc-env=VOICE_NAME={}", config.session.voice_name);
    println!("cargo:rustc-env=INPUT_TRANSCRIPTION={}", config.session.input_transcription);
    println!("cargo:rustc-env=OUTPUT_TRANSCRIPTION={}", config.session.output_transcription);

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=CAPTURE_SAMPLE_RATE={}", config.audio.capture_sample_rate);
    println!("cargo:rustc-env=PLAYBACK_SAMPLE_RATE={}", config.audio.playback_sample_rate);
    println!("cargo:rustc-env=CAPTURE_FRAME_SIZE={}", config.audio.capture_frame_size);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", config.audio.playback_period_size);
}
