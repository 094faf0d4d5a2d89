//! View registry with concurrent registration.
//!
//! Registration is two-phase: a camera id is first reserved under its own
//! lock (duplicate ids are rejected there and stay reserved), the fully
//! constructed view is then published atomically into a dense table. The
//! matching and reconstruction phases access the table exclusively through
//! `&mut` and never contend with `add`.

use crate::types::CameraId;
use crate::view::View;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Registration failures. All are logged by the engine; none mutate
/// published state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    /// The camera id was already reserved or published.
    #[error("camera id [{0}] already in use")]
    DuplicateCamera(CameraId),
    /// The tie-point / visual-neighbor list was empty.
    #[error("view [{0}] has no tie-points or visual neighbors")]
    NoTiePoints(CameraId),
    /// No usable 2D segments were supplied or detected.
    #[error("no line segments found in image [{0}]")]
    NoSegments(CameraId),
}

/// How a registered view connects to the others.
#[derive(Clone, Debug)]
pub enum ViewLinks {
    /// Ids of tie-points (world points) observed by the view.
    WorldPoints(Vec<u32>),
    /// Explicit visual-neighbor camera ids.
    Neighbors(Vec<CameraId>),
}

#[derive(Default)]
pub(crate) struct RegistryInner {
    views: Vec<View>,
    index: HashMap<CameraId, usize>,
    wp_to_views: HashMap<u32, Vec<CameraId>>,
    view_wps: HashMap<CameraId, Vec<u32>>,
    fixed_neighbors: HashMap<CameraId, Vec<CameraId>>,
}

impl RegistryInner {
    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Views in registration order.
    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn views_mut(&mut self) -> &mut [View] {
        &mut self.views
    }

    pub fn view(&self, idx: usize) -> &View {
        &self.views[idx]
    }

    pub fn view_mut(&mut self, idx: usize) -> &mut View {
        &mut self.views[idx]
    }

    pub fn index_of(&self, cam: CameraId) -> Option<usize> {
        self.index.get(&cam).copied()
    }

    pub fn view_by_id(&self, cam: CameraId) -> Option<&View> {
        self.index_of(cam).map(|idx| &self.views[idx])
    }

    pub fn worldpoints_of(&self, cam: CameraId) -> Option<&[u32]> {
        self.view_wps.get(&cam).map(Vec::as_slice)
    }

    pub fn views_seeing(&self, wp: u32) -> Option<&[CameraId]> {
        self.wp_to_views.get(&wp).map(Vec::as_slice)
    }

    pub fn fixed_neighbors_of(&self, cam: CameraId) -> Option<&[CameraId]> {
        self.fixed_neighbors.get(&cam).map(Vec::as_slice)
    }

    pub fn total_segments(&self) -> usize {
        self.views.iter().map(View::num_segments).sum()
    }
}

/// Dense, insertion-ordered table of registered views.
pub struct ViewRegistry {
    reserved: Mutex<HashSet<CameraId>>,
    inner: RwLock<RegistryInner>,
}

impl Default for ViewRegistry {
    fn default() -> Self {
        Self {
            reserved: Mutex::new(HashSet::new()),
            inner: RwLock::new(RegistryInner::default()),
        }
    }
}

impl ViewRegistry {
    /// First registration phase: claim the camera id. The id stays claimed
    /// even if the caller later fails to publish a view for it.
    pub fn reserve(&self, cam: CameraId) -> Result<(), RegisterError> {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !reserved.insert(cam) {
            return Err(RegisterError::DuplicateCamera(cam));
        }
        Ok(())
    }

    /// Second registration phase: publish the constructed view together with
    /// its tie-point or neighbor links.
    pub(crate) fn publish(&self, view: View, links: ViewLinks) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let cam = view.id();
        let idx = inner.views.len();
        inner.views.push(view);
        inner.index.insert(cam, idx);
        match links {
            ViewLinks::WorldPoints(wps) => {
                for &wp in &wps {
                    inner.wp_to_views.entry(wp).or_default().push(cam);
                }
                inner.view_wps.insert(cam, wps);
            }
            ViewLinks::Neighbors(neighbors) => {
                inner.fixed_neighbors.insert(cam, neighbors);
            }
        }
    }

    /// Number of published views.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exclusive access for the pipeline phases.
    pub(crate) fn inner_mut(&mut self) -> &mut RegistryInner {
        self.inner.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared read access (used by accessors that may run concurrently with
    /// registration).
    pub(crate) fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Vector3};

    fn dummy_view(id: u32) -> View {
        View::new(
            CameraId(id),
            Matrix3::identity(),
            Matrix3::identity(),
            Vector3::zeros(),
            100,
            100,
            1.0,
            Vec::new(),
        )
    }

    #[test]
    fn duplicate_reservation_is_rejected() {
        let registry = ViewRegistry::default();
        assert!(registry.reserve(CameraId(7)).is_ok());
        assert_eq!(
            registry.reserve(CameraId(7)),
            Err(RegisterError::DuplicateCamera(CameraId(7)))
        );
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn publish_preserves_registration_order() {
        let registry = ViewRegistry::default();
        for id in [4u32, 2, 9] {
            registry.reserve(CameraId(id)).unwrap();
            registry.publish(dummy_view(id), ViewLinks::WorldPoints(vec![1, 2]));
        }
        let inner = registry.read();
        let order: Vec<u32> = inner.views().iter().map(|v| v.id().0).collect();
        assert_eq!(order, vec![4, 2, 9]);
        assert_eq!(inner.index_of(CameraId(9)), Some(2));
        assert_eq!(inner.views_seeing(1).unwrap().len(), 3);
        assert_eq!(inner.worldpoints_of(CameraId(2)), Some(&[1u32, 2][..]));
    }

    #[test]
    fn concurrent_reservation_admits_each_id_once() {
        use std::sync::Arc;

        let registry = Arc::new(ViewRegistry::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                let mut admitted = 0;
                for id in 0..16u32 {
                    if registry.reserve(CameraId(id)).is_ok() {
                        registry.publish(dummy_view(id), ViewLinks::WorldPoints(vec![0]));
                        admitted += 1;
                    }
                }
                admitted
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 16);
        assert_eq!(registry.len(), 16);
    }
}
