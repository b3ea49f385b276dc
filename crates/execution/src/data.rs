//! Output data reported by robot code.

use std::sync::Arc;

use harvester_core::{Feature, FeatureId, RootScope, ScopeNode};
use serde::{Deserialize, Serialize};
use tracing::debug;

const ON_DATA_RECEIVED: &str = "on_data_received";

/// One piece of output data, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItem {
    /// Kind of the data, e.g. `product`
    pub kind: String,
    /// Payload
    pub data: serde_json::Value,
}

/// Forwards data reported inside a run to the run's consumer.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataFeature;

impl DataFeature {
    /// Feature id.
    pub const ID: FeatureId = "data";

    /// Called for every reported item.
    pub fn on_data_received<F>(root: &RootScope, f: F)
    where
        F: Fn(&DataItem, &Arc<ScopeNode>) + Send + Sync + 'static,
    {
        root.feature_config(Self::ID)
            .assign_callback::<DataItem, _>(ON_DATA_RECEIVED, f);
    }

    /// Report `data` of `kind` from `scope`. Dropped once the run is cancelled.
    pub fn report_data<T: Serialize>(
        scope: &Arc<ScopeNode>,
        kind: impl Into<String>,
        data: &T,
    ) -> harvester_core::Result<()> {
        let item = DataItem {
            kind: kind.into(),
            data: serde_json::to_value(data)?,
        };
        if scope.root().is_cancelled() {
            debug!(kind = %item.kind, scope = %scope.full_execution_label(), "run cancelled, dropping data");
            return Ok(());
        }
        scope
            .feature_config(Self::ID)
            .invoke_callback(ON_DATA_RECEIVED, scope, &item);
        Ok(())
    }
}

impl Feature for DataFeature {
    fn id(&self) -> FeatureId {
        Self::ID
    }
}
