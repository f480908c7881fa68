use metrics::Label;

use crate::error::LoadStage;
use crate::metrics::{
    DESTINATION_ID_LABEL, NAMESPACE_LABEL, STAGE_LABEL, TABLE_NAME_LABEL, WORKSPACE_ID_LABEL,
};

/// Telemetry dimensions of one load attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTags {
    pub workspace_id: String,
    pub namespace: String,
    pub destination_id: String,
    pub table: String,
    pub stage: Option<LoadStage>,
}

impl LoadTags {
    /// Returns a copy of the tags with `stage` set.
    pub fn with_stage(&self, stage: Option<LoadStage>) -> LoadTags {
        LoadTags {
            stage,
            ..self.clone()
        }
    }

    /// Renders the tags as metric labels; `stage` is omitted when unset.
    pub fn labels(&self) -> Vec<Label> {
        let mut labels = vec![
            Label::new(WORKSPACE_ID_LABEL, self.workspace_id.clone()),
            Label::new(NAMESPACE_LABEL, self.namespace.clone()),
            Label::new(DESTINATION_ID_LABEL, self.destination_id.clone()),
            Label::new(TABLE_NAME_LABEL, self.table.clone()),
        ];
        if let Some(stage) = self.stage {
            labels.push(Label::new(STAGE_LABEL, stage.as_str()));
        }

        labels
    }
}
