//! The SPE document: the event sampling body plus the name of the hardware feature that
//! produced it.
use serde_json::Value;

use super::event::Body;
use super::*;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Document {
    pub feature_name: String,
    pub sampling: Body,
}

impl Schema for Document {
    fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    fn into_record(self) -> SamplingRecord {
        self.sampling.into_record(RecordKind::Spe {
            feature_name: self.feature_name,
        })
    }

    fn from_record(record: &SamplingRecord) -> Self {
        Document {
            feature_name: record.kind.feature_name().unwrap_or("SPE").to_string(),
            sampling: Body::from_record(record),
        }
    }
}
