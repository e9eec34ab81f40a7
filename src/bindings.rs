//! wasm-bindgen surface over the rig registry. Every function takes a rig
//! handle from `create_rig` and degrades to a neutral value for stale ones.

use crate::bone::{PoseParamId, SequenceId};
use crate::rig::{flat_ground, FrameRequest, RigInstance};
use crate::state::{with_registry_mut, with_rig, with_rig_mut, RigHandle};
use glam::{Affine3A, Mat4};
use wasm_bindgen::prelude::*;

fn log_level() -> log::Level {
    cfg_if::cfg_if! {
        if #[cfg(debug_assertions)] {
            log::Level::Debug
        } else {
            log::Level::Info
        }
    }
}

/// Install the panic hook and route `log` to the browser console
#[wasm_bindgen]
pub fn init_logging() {
    console_error_panic_hook::set_once();
    console_log::init_with_level(log_level()).ok();
}

/// Load a rig document, returning its handle or 0 on failure
#[wasm_bindgen]
pub fn create_rig(rig_json: &str, config_json: Option<String>) -> RigHandle {
    let rig = match RigInstance::from_json(rig_json, config_json.as_deref()) {
        Ok(rig) => rig,
        Err(e) => {
            log::error!("Failed to load rig: {}", e);
            return 0;
        }
    };
    let name = rig.library().name.clone();
    match with_registry_mut(|rigs| rigs.insert(rig)) {
        Some(handle) => {
            log::info!("Created rig '{}' as {:#x}", name, handle);
            handle
        }
        None => 0,
    }
}

#[wasm_bindgen]
pub fn destroy_rig(handle: RigHandle) -> bool {
    with_registry_mut(|rigs| rigs.remove(handle)).is_some()
}

/// Index of a sequence by name
#[wasm_bindgen]
pub fn rig_sequence_index(handle: RigHandle, name: &str) -> Option<u16> {
    with_rig(handle, |rig| rig.library().sequence_index(name).map(|id| id.0)).flatten()
}

#[wasm_bindgen]
pub fn set_pose_parameter(handle: RigHandle, param: u16, value: f32) -> bool {
    with_rig_mut(handle, |rig| rig.set_pose_parameter(PoseParamId(param), value)).unwrap_or(false)
}

/// Evaluate one frame.
///
/// `root` is a column-major 4x4 matrix placing the character; anything but
/// 16 floats means identity. With `ground_height` set, grounded feet are
/// traced against the plane at that height.
#[wasm_bindgen]
pub fn evaluate_rig(
    handle: RigHandle,
    sequence: u16,
    cycle: f32,
    time: f32,
    root: &[f32],
    ground_height: Option<f32>,
) -> bool {
    let root = match root.len() {
        16 => Affine3A::from_mat4(Mat4::from_cols_slice(root)),
        _ => Affine3A::IDENTITY,
    };
    let mut request = FrameRequest::new(SequenceId(sequence), cycle, time);
    request.root = root;

    with_rig_mut(handle, |rig| {
        match ground_height {
            Some(height) => rig.evaluate_frame(&request, flat_ground(height)),
            None => rig.evaluate_frame(&request, |_| None),
        }
        true
    })
    .unwrap_or(false)
}

/// Local pose as `[px, py, pz, qx, qy, qz, qw]` per bone
#[wasm_bindgen]
pub fn rig_local_pose(handle: RigHandle) -> Vec<f32> {
    with_rig(handle, |rig| {
        let pose = rig.pose();
        pose.positions
            .iter()
            .zip(&pose.rotations)
            .flat_map(|(p, q)| [p.x, p.y, p.z, q.x, q.y, q.z, q.w])
            .collect()
    })
    .unwrap_or_default()
}

/// Packed 3x4 matrices of the cached bones, empty once the cache is stale
#[wasm_bindgen]
pub fn rig_bone_matrices(handle: RigHandle, time: f32) -> Vec<f32> {
    with_rig_mut(handle, |rig| {
        rig.bone_matrices(time)
            .map(|m| bytemuck::cast_slice::<_, f32>(m).to_vec())
            .unwrap_or_default()
    })
    .unwrap_or_default()
}

#[wasm_bindgen]
pub fn clear_rig_targets(handle: RigHandle) -> bool {
    with_rig_mut(handle, RigInstance::clear_targets).is_some()
}

/// Snapshot of the IK target slots for debugging overlays
#[wasm_bindgen]
pub fn rig_ik_targets(handle: RigHandle) -> Result<JsValue, JsValue> {
    with_rig(handle, |rig| serde_wasm_bindgen::to_value(&rig.ik_targets()))
        .ok_or_else(|| JsValue::from_str("unknown rig handle"))?
        .map_err(|e| JsValue::from_str(&e.to_string()))
}
