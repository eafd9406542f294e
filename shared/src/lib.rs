use serde::de::{self, DeserializeOwned, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
}

/// Invocation event accepted by the handler.
///
/// `reconstruction_threshold` and `ssim_threshold` are part of the contract
/// but the detector always applies its own fixed limits.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub base64_img: String,
    pub reconstruction_threshold: f64,
    pub ssim_threshold: f64,
    pub grad_cam_threshold: f64,
}

/// Label-keyed JSON object that keeps the classifier's label order.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap<V>(Vec<(String, V)>);

impl<V> Default for LabelMap<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V> LabelMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the value for `label`, keeping its first position.
    pub fn insert(&mut self, label: impl Into<String>, value: V) {
        let label = label.into();
        match self.0.iter_mut().find(|(k, _)| *k == label) {
            Some(entry) => entry.1 = value,
            None => self.0.push((label, value)),
        }
    }

    pub fn get(&self, label: &str) -> Option<&V> {
        self.0.iter().find(|(k, _)| k == label).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }
}

impl<V> FromIterator<(String, V)> for LabelMap<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        let mut map = LabelMap::new();
        for (label, value) in iter {
            map.insert(label, value);
        }
        map
    }
}

impl<V: Serialize> Serialize for LabelMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, value) in &self.0 {
            map.serialize_entry(label, value)?;
        }
        map.end()
    }
}

struct LabelMapVisitor<V>(PhantomData<V>);

impl<'de, V: Deserialize<'de>> Visitor<'de> for LabelMapVisitor<V> {
    type Value = LabelMap<V>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an object keyed by label")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries: Vec<(String, V)> = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((label, value)) = access.next_entry::<String, V>()? {
            if entries.iter().any(|(k, _)| *k == label) {
                return Err(de::Error::custom(format!("duplicate label `{}`", label)));
            }
            entries.push((label, value));
        }
        Ok(LabelMap(entries))
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for LabelMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(LabelMapVisitor(PhantomData))
    }
}

/// serde_json writes NaN metrics as `null`; read them back as NaN.
fn nan_from_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Successful response body. Out-of-distribution images carry `null` for
/// both the prediction and the saliency maps.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum InferenceBody {
    #[serde(rename_all = "camelCase")]
    InDistribution {
        #[serde(deserialize_with = "nan_from_null")]
        reconstruction_error: f64,
        #[serde(deserialize_with = "nan_from_null")]
        ssim: f64,
        in_distribution: bool,
        prediction: LabelMap<f64>,
        grad_cam: LabelMap<String>,
    },
    #[serde(rename_all = "camelCase")]
    OutOfDistribution {
        #[serde(deserialize_with = "nan_from_null")]
        reconstruction_error: f64,
        #[serde(deserialize_with = "nan_from_null")]
        ssim: f64,
        in_distribution: bool,
        prediction: (),
        grad_cam: (),
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorBody {
    #[serde(rename = "Error")]
    pub error: String,
}

/// Response envelope: status code, fixed JSON content type, serialized body.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl InferenceResponse {
    pub const CONTENT_TYPE: &'static str = "application/json";

    fn json_headers() -> BTreeMap<String, String> {
        BTreeMap::from([("Content-Type".to_string(), Self::CONTENT_TYPE.to_string())])
    }

    pub fn from_body<T: Serialize>(status_code: u16, body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            status_code,
            headers: Self::json_headers(),
            body: serde_json::to_string(body)?,
        })
    }

    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            headers: Self::json_headers(),
            body: serde_json::json!({ "Error": message.into() }).to_string(),
        }
    }

    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}
