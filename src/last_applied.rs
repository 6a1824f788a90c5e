use crate::{
    crd::{ModelBox, ModelBoxSpec},
    error::Error,
};

pub const LAST_APPLIED_ANNOTATION: &str = "modelbox.model.github.com/last-oldSpec";

pub trait LastApplied: Send + Sync {
    /// Returns `Ok(None)` when nothing has been recorded yet.
    fn get(&self, model_box: &ModelBox) -> Result<Option<ModelBoxSpec>, Error>;

    /// Records `spec` on the in-memory object; the caller persists it.
    fn set(&self, model_box: &mut ModelBox, spec: &ModelBoxSpec) -> Result<(), Error>;
}

#[derive(Clone, Debug)]
pub struct AnnotationLastApplied {
    key: String,
}

impl AnnotationLastApplied {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for AnnotationLastApplied {
    fn default() -> Self {
        Self::with_key(LAST_APPLIED_ANNOTATION)
    }
}

impl LastApplied for AnnotationLastApplied {
    fn get(&self, model_box: &ModelBox) -> Result<Option<ModelBoxSpec>, Error> {
        model_box
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(&self.key))
            .map(|raw| serde_json::from_str(raw))
            .transpose()
            .map_err(Error::from)
    }

    fn set(&self, model_box: &mut ModelBox, spec: &ModelBoxSpec) -> Result<(), Error> {
        let raw = serde_json::to_string(spec)?;
        model_box
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(self.key.clone(), raw);
        Ok(())
    }
}
