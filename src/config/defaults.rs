use super::*;

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: 502,
            unit_id: 255,
            connect_attempts: 3,
            retry_delay_ms: 1000,
            connect_timeout_ms: 5000,
            operation_timeout_ms: 5000,
            close_timeout_ms: 2000,
            max_registers_per_request: 110,
            max_register_gap: 4,
            degraded_after_failures: 3,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 5,
            optional_block_failure_threshold: 1,
            failure_notification_threshold: 3,
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            register: 6000,
            set_value: 1,
            reset_value: 0,
            poll_interval_ms: 1000,
            max_polls: 10,
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            base_url: None,
            username: "admin".to_string(),
            password: String::new(),
            timeout_secs: 30,
            token_lifetime_secs: 3600,
            refresh_margin_secs: 300,
            max_attempts: 3,
            initial_backoff_ms: 1000,
            accept_invalid_certs: true,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            max_current_a: 32.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/wallbox-sync.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            modbus: ModbusConfig::default(),
            polling: PollingConfig::default(),
            keepalive: KeepAliveConfig::default(),
            rest: RestConfig::default(),
            hardware: HardwareConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
