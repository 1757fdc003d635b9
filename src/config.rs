#[derive(Debug, Clone)]
pub struct Config {
    // 网络配置
    pub ws_url: &'static str,
    pub model: String,
    pub api_key: String,
    pub close_timeout_ms: u64,

    // 会话参数
    pub system_prompt: &'static str,
    pub voice_name: &'static str,
    pub input_transcription: bool,
    pub output_transcription: bool,

    // 音频设备配置
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub capture_frame_size: usize,
    pub playback_period_size: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            ws_url: env!("WS_URL"),
            model: env!("LIVE_MODEL").to_string(),
            api_key: env!("LIVE_API_KEY").to_string(),
            close_timeout_ms: env!("CLOSE_TIMEOUT_MS").parse()
                .map_err(|_| "Failed to parse CLOSE_TIMEOUT_MS")?,

            system_prompt: env!("SYSTEM_PROMPT"),
            voice_name: env!("VOICE_NAME"),
            input_transcription: env!("INPUT_TRANSCRIPTION").parse()
                .map_err(|_| "Failed to parse INPUT_TRANSCRIPTION")?,
            output_transcription: env!("OUTPUT_TRANSCRIPTION").parse()
                .map_err(|_| "Failed to parse OUTPUT_TRANSCRIPTION")?,

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            capture_sample_rate: env!("CAPTURE_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse CAPTURE_SAMPLE_RATE")?,
            playback_sample_rate: env!("PLAYBACK_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_SAMPLE_RATE")?,
            capture_frame_size: env!("CAPTURE_FRAME_SIZE").parse()
                .map_err(|_| "Failed to parse CAPTURE_FRAME_SIZE")?,
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,
        })
    }

    /// 运行时覆盖：密钥不必编译进二进制
    pub fn with_env_overrides(mut self) -> Self {
        let key = std::env::var("LIVE_VOICE_API_KEY").or_else(|_| std::env::var("GEMINI_API_KEY"));
        if let Ok(key) = key {
            if !key.trim().is_empty() {
                self.api_key = key.trim().to_string();
            }
        }
        if let Ok(model) = std::env::var("LIVE_VOICE_MODEL") {
            if !model.trim().is_empty() {
                self.model = model.trim().to_string();
            }
        }
        self
    }

    pub fn close_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baked_defaults_match_live_audio_rates() {
        let config = Config::default();
        assert_eq!(config.capture_sample_rate, 16000);
        assert_eq!(config.playback_sample_rate, 24000);
        assert_eq!(config.capture_frame_size, 4096);
        assert!(!config.system_prompt.contains('\n'));
    }
}
