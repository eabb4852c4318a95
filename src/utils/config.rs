//! Tunable parameters struct parsing helper.

/// Composes a parameters struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(params)` on success, and `Err(LoadError)` on parser failure.
///
/// Example:
/// ```no_compile
/// let params = parsed_config!(params_str => MyParams; batch_size, seed)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, $crate::LoadError> {
            let mut config: $config_type = Default::default();
            let Some(config_str) = config_str else {
                return Ok(config);
            };

            let mut table = config_str.parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if let Some(key) = table.keys().next() {
                return Err($crate::LoadError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::LoadError;

    #[derive(Debug, PartialEq)]
    struct TestParams {
        interval: u64,
        name: String,
        ratio: f64,
    }

    impl Default for TestParams {
        fn default() -> Self {
            TestParams {
                interval: 100,
                name: "leader".into(),
                ratio: 0.5,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), LoadError> {
        let params = parsed_config!(None => TestParams; interval, name, ratio)?;
        assert_eq!(params, TestParams::default());
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), LoadError> {
        let params_str = Some("name = 'broadcast'\ninterval = 7");
        let params =
            parsed_config!(params_str => TestParams; interval, name, ratio)?;
        let ref_params = TestParams {
            interval: 7,
            name: "broadcast".into(),
            ratio: 0.5,
        };
        assert_eq!(params, ref_params);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let params_str = Some("xyz = 999");
        assert!(parsed_config!(params_str => TestParams; interval).is_err());
    }

    #[test]
    fn parse_wrong_type() {
        let params_str = Some("interval = 'soon'");
        assert!(parsed_config!(params_str => TestParams; interval).is_err());
    }
}
