use std::io;

/// Runtime configuration, backed by an optional toml file.
///
/// Keys understood by the pipeline:
/// - `pipeline.queue_size`: bound of every inter-task channel (default 64)
/// - `defrag.max_pending`: max in-progress fragment sets per address family
///   (default 1024)
/// - `tcp.max_flows`: max concurrently tracked TCP flows (default 4096)
#[derive(Default)]
pub struct Config {
    value: Option<toml::Value>,
}

impl Config {
    /// Get an integer entry by path. Dots split the path into nested keys.
    pub fn get_usize<T: AsRef<str>>(&self, k: T) -> Option<usize> {
        self.get_path(k)?
            .as_integer()
            .and_then(|i| usize::try_from(i).ok())
    }

    fn get_path<T: AsRef<str>>(&self, k: T) -> Option<&toml::Value> {
        let mut item = self.value.as_ref()?;
        for key in k.as_ref().split('.') {
            item = item.get(key)?;
        }
        Some(item)
    }

    /// Load configuration, replacing any previous content.
    pub fn load_config<R: io::Read>(&mut self, mut config: R) -> Result<(), io::Error> {
        let mut s = String::new();
        config.read_to_string(&mut s)?;
        let table = s
            .parse::<toml::Table>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.value = Some(toml::Value::Table(table));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn config_nested_keys() {
        let mut config = Config::default();
        config
            .load_config(&b"[pipeline]\nqueue_size = 8\n"[..])
            .unwrap();
        assert_eq!(config.get_usize("pipeline.queue_size"), Some(8));
        assert_eq!(config.get_usize("pipeline.missing"), None);
        assert_eq!(config.get_usize("tcp.max_flows"), None);
    }
}
