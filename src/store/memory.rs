use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use kube::ResourceExt;

use super::{Derived, DerivedKind, Store};
use crate::{
    crd::{ModelBox, ModelBoxStatus},
    error::{Error, api_error},
};

type Key = (String, String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    UpdateModelBox,
    PatchStatus,
    Create(DerivedKind),
    Update(DerivedKind),
}

#[derive(Default)]
struct State {
    model_boxes: BTreeMap<Key, ModelBox>,
    derived: BTreeMap<(DerivedKind, String, String), Derived>,
    calls: BTreeMap<Op, u32>,
    /// Writes that will fail with Conflict before reaching the object.
    conflicts: BTreeMap<Op, u32>,
    /// Writes that will fail with a server error.
    failures: BTreeMap<Op, u32>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub fn insert_model_box(&self, mut model_box: ModelBox) -> ModelBox {
        let key = key_of(&model_box);
        model_box.metadata.uid.get_or_insert_with(|| format!("uid-{}", key.1));
        model_box.metadata.resource_version = Some(self.next_version());
        self.state
            .lock()
            .unwrap()
            .model_boxes
            .insert(key, model_box.clone());
        model_box
    }

    pub fn edit_model_box(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut ModelBox)) {
        let version = self.next_version();
        let mut state = self.state.lock().unwrap();
        let model_box = state
            .model_boxes
            .get_mut(&(namespace.to_string(), name.to_string()))
            .unwrap();
        edit(model_box);
        model_box.metadata.resource_version = Some(version);
    }

    pub fn model_box(&self, namespace: &str, name: &str) -> Option<ModelBox> {
        self.state
            .lock()
            .unwrap()
            .model_boxes
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn derived(&self, kind: DerivedKind, namespace: &str, name: &str) -> Option<Derived> {
        self.state
            .lock()
            .unwrap()
            .derived
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn remove_derived(&self, kind: DerivedKind, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .derived
            .remove(&(kind, namespace.to_string(), name.to_string()));
    }

    /// Replaces a stored derived object as another writer would, bumping its version.
    pub fn put_derived(&self, mut object: Derived) {
        object.meta_mut().resource_version = Some(self.next_version());
        let key = derived_key(&object);
        self.state.lock().unwrap().derived.insert(key, object);
    }

    pub fn calls(&self, op: Op) -> u32 {
        self.state.lock().unwrap().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> u32 {
        self.state.lock().unwrap().calls.values().sum()
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn inject_conflicts(&self, op: Op, count: u32) {
        self.state.lock().unwrap().conflicts.insert(op, count);
    }

    pub fn inject_failures(&self, op: Op, count: u32) {
        self.state.lock().unwrap().failures.insert(op, count);
    }

    fn begin_write(&self, op: Op) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_default() += 1;
        if let Some(remaining) = state.failures.get_mut(&op).filter(|n| **n > 0) {
            *remaining -= 1;
            return Err(api_error(503, "ServiceUnavailable"));
        }
        if let Some(remaining) = state.conflicts.get_mut(&op).filter(|n| **n > 0) {
            *remaining -= 1;
            return Err(api_error(409, "Conflict"));
        }
        Ok(())
    }
}

fn key_of(model_box: &ModelBox) -> Key {
    (model_box.namespace().unwrap_or_default(), model_box.name_any())
}

fn derived_key(object: &Derived) -> (DerivedKind, String, String) {
    let meta = object.meta();
    (
        object.kind(),
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_model_box(&self, namespace: &str, name: &str) -> Result<Option<ModelBox>, Error> {
        Ok(self.model_box(namespace, name))
    }

    async fn update_model_box(&self, model_box: &ModelBox) -> Result<ModelBox, Error> {
        self.begin_write(Op::UpdateModelBox)?;
        let version = self.next_version();
        let mut state = self.state.lock().unwrap();
        let Some(stored) = state.model_boxes.get_mut(&key_of(model_box)) else {
            return Err(api_error(404, "NotFound"));
        };
        if stored.metadata.resource_version != model_box.metadata.resource_version {
            return Err(api_error(409, "Conflict"));
        }

        stored.metadata = model_box.metadata.clone();
        stored.spec = model_box.spec.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn patch_model_box_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ModelBoxStatus,
    ) -> Result<(), Error> {
        self.begin_write(Op::PatchStatus)?;
        let version = self.next_version();
        let mut state = self.state.lock().unwrap();
        let Some(stored) = state
            .model_boxes
            .get_mut(&(namespace.to_string(), name.to_string()))
        else {
            return Err(api_error(404, "NotFound"));
        };

        stored.status = Some(status.clone());
        stored.metadata.resource_version = Some(version);
        Ok(())
    }

    async fn get(
        &self,
        kind: DerivedKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Derived>, Error> {
        Ok(self.derived(kind, namespace, name))
    }

    async fn create(&self, object: &Derived) -> Result<Derived, Error> {
        self.begin_write(Op::Create(object.kind()))?;
        let key = derived_key(object);
        let mut created = object.clone();
        created.meta_mut().uid = Some(format!("uid-{}-{}", key.0, key.2));
        created.meta_mut().resource_version = Some(self.next_version());

        let mut state = self.state.lock().unwrap();
        if state.derived.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.derived.insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, object: &Derived) -> Result<Derived, Error> {
        self.begin_write(Op::Update(object.kind()))?;
        let version = self.next_version();
        let mut state = self.state.lock().unwrap();
        let Some(stored) = state.derived.get_mut(&derived_key(object)) else {
            return Err(api_error(404, "NotFound"));
        };
        if stored.meta().resource_version != object.meta().resource_version {
            return Err(api_error(409, "Conflict"));
        }

        *stored = object.clone();
        stored.meta_mut().resource_version = Some(version);
        Ok(stored.clone())
    }
}
