//! Reading chain geometry and other settings from YAML files

use std::path::Path;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_saphyr::Options;

use crate::parameter_error::ParameterError;
use crate::parameters::Parameters;

/// Deserializes YAML, allowing angles to be written as `deg(...)` or `rad(...)`.
pub(crate) fn from_yaml_str<T: DeserializeOwned>(yaml: &str) -> Result<T, ParameterError> {
    serde_saphyr::from_str_with_options(
        yaml,
        Options {
            angle_conversions: true,
            ..Default::default()
        },
    )
    .map_err(|e| ParameterError::ParseError(format!("{}", e)))
}

#[derive(Deserialize)]
struct Root {
    chain: Parameters,
}

impl Parameters {
    /// Read the chain geometry from YAML file. YAML file like this is supported:
    /// ```yaml
    /// # Stretch 3, dexterous wrist
    /// chain:
    ///   mast_x: -0.07
    ///   mast_y: -0.135
    ///   lift_z0: 0.19
    ///   arm_y0: 0.115
    ///   yaw_to_pitch: 0.02
    ///   yaw_to_pitch_z: -0.06
    ///   pitch_to_pinch: 0.21
    ///   yaw_mount: deg(-90.0)
    /// ```
    /// Missing fields take the value of [Parameters::stretch].
    ///
    /// YAML extension to parse the deg(angle) function is supported (serde_saphyr).
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ParameterError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ParameterError> {
        let root: Root = from_yaml_str(contents)?;
        root.chain.validate()?;
        Ok(root.chain)
    }
}
