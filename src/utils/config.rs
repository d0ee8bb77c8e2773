//! Node options struct parsing helper.

/// Composes an options struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`.
/// Returns an `Ok(options)` on success, and `Err(ReplSetError)` on parser
/// failure.
///
/// Example:
/// ```ignore
/// let opts = parsed_config!(config_str => ReplOptions; replset, master)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, ReplSetError> {
            let mut config: $config_type = Default::default();
            if config_str.is_none() {
                return Ok(config);
            }

            let mut table = config_str.unwrap().parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    if let Ok(v) = v.try_into() {
                        config.$field = v;
                    } else {
                        return Err(ReplSetError(
                            ErrorCode::BadValue,
                            format!(
                                "invalid value for field '{}' in config",
                                stringify!($field),
                            ),
                        ));
                    }
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if !table.is_empty() {
                return Err(ReplSetError(
                    ErrorCode::BadValue,
                    format!(
                        "invalid field name '{}' in config",
                        table.keys().next().unwrap(),
                    ),
                ));
            }

            Ok(config)
        };

        compose_config()
    }};
}
