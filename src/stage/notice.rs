use crate::foundation::core::PrimPath;

#[derive(Clone, Debug, PartialEq)]
/// Change notification emitted by a [`crate::stage::composed::Stage`].
pub enum StageNotice {
    /// Composed objects changed.
    ObjectsChanged {
        /// Paths whose topology changed.
        resynced: Vec<PrimPath>,
        /// Paths whose values or metadata changed.
        changed_info_only: Vec<PrimPath>,
    },
    /// The set of muted layers changed.
    LayerMutingChanged {
        /// Newly muted identifiers.
        muted: Vec<String>,
        /// Newly unmuted identifiers.
        unmuted: Vec<String>,
    },
    /// The edit target moved to another layer.
    EditTargetChanged {
        /// Identifier of the new edit target layer.
        identifier: String,
    },
    /// Some layer content of the stage changed.
    ContentsChanged,
}

impl StageNotice {
    /// Short kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            StageNotice::ObjectsChanged { .. } => "objects_changed",
            StageNotice::LayerMutingChanged { .. } => "layer_muting_changed",
            StageNotice::EditTargetChanged { .. } => "edit_target_changed",
            StageNotice::ContentsChanged => "contents_changed",
        }
    }
}
