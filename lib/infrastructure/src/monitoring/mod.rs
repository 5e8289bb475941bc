use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MonitoringConfig {
    pub default_level: String,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub json: bool,
}

impl MonitoringConfig {
    pub fn init(&self) -> anyhow::Result<()> {
        let filter = EnvFilter::builder()
            .with_default_directive(self.default_level.parse()?)
            .parse(self.filters.join(","))?;

        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        if self.json {
            builder.json().init();
        } else {
            builder.init();
        }

        Ok(())
    }
}
