//! Pre-validation of synthetic data sets from their manifest properties

use super::events::PreValidator;
use super::manifest::DataSetManifest;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::warn;

const START_SUFFIX: &str = "_start";
const END_SUFFIX: &str = "_end";

/// Checks the id ranges a synthetic data set declares in its pre-validation
/// properties.
///
/// Every `<name>_start` needs a `<name>_end` and vice versa. Numeric ranges
/// must not run backwards; synthetic ids are negative, so they are compared
/// by magnitude.
#[derive(Debug, Default, Clone, Copy)]
pub struct PropertiesPreValidator;

impl PropertiesPreValidator {
    pub fn check(properties: &BTreeMap<String, String>) -> Result<(), String> {
        for (key, start) in properties {
            let Some(name) = key.strip_suffix(START_SUFFIX) else {
                continue;
            };
            let end_key = format!("{}{}", name, END_SUFFIX);
            let end = properties
                .get(&end_key)
                .ok_or_else(|| format!("'{}' has no matching '{}'", key, end_key))?;

            if let (Ok(start), Ok(end)) = (start.trim().parse::<i64>(), end.trim().parse::<i64>()) {
                if start.unsigned_abs() > end.unsigned_abs() {
                    return Err(format!("range {} runs backwards: {} > {}", name, start, end));
                }
            }
        }

        for key in properties.keys() {
            if let Some(name) = key.strip_suffix(END_SUFFIX) {
                let start_key = format!("{}{}", name, START_SUFFIX);
                if !properties.contains_key(&start_key) {
                    return Err(format!("'{}' has no matching '{}'", key, start_key));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl PreValidator for PropertiesPreValidator {
    async fn is_valid(&self, manifest: &DataSetManifest) -> anyhow::Result<bool> {
        let Some(properties) = manifest.pre_validation_properties() else {
            return Ok(true);
        };

        match Self::check(properties) {
            Ok(()) => Ok(true),
            Err(reason) => {
                warn!(manifest = %manifest.id(), reason = %reason, "Pre-validation rejected data set");
                Ok(false)
            },
        }
    }
}
