//! 人脸库服务
//!
//! 已确认的人脸特征 + 待确认缓存, 可选 JSON 持久化.
//! 识别线程通过 `features()` 取得只读快照.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PoseLimits;
use crate::detection::FaceObservation;
use crate::pipeline::sync::lock;

/// 身份 → 特征向量
pub type FaceFeatures = HashMap<String, Vec<f32>>;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("no face named '{0}'")]
    NotFound(String),
    #[error("a face named '{0}' already exists")]
    AlreadyExists(String),
    #[error("no captured face is waiting for confirmation")]
    NoPending,
    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("{}: {source}", path.display())]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub name: String,
    pub is_host: bool,
    pub feature: Vec<f32>,
}

/// 列表项 (不含特征)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaceEntry {
    pub name: String,
    pub is_host: bool,
}

/// 姿态检查不通过的原因
#[derive(Debug, Clone, PartialEq)]
pub enum PoseRejection {
    NoFace,
    MultipleFaces(usize),
    LowScore(f32),
    OutOfRange { yaw: f32, pitch: f32, roll: f32 },
}

impl std::fmt::Display for PoseRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoseRejection::NoFace => write!(f, "no face"),
            PoseRejection::MultipleFaces(n) => write!(f, "{} faces in view", n),
            PoseRejection::LowScore(score) => write!(f, "face score {:.2} too low", score),
            PoseRejection::OutOfRange { yaw, pitch, roll } => write!(
                f,
                "pose out of range (yaw {:.1}, pitch {:.1}, roll {:.1})",
                yaw, pitch, roll
            ),
        }
    }
}

/// 只接受单张、置信度足够且角度在范围内的人脸
pub fn check_face_pose<'a>(
    faces: &'a [FaceObservation],
    limits: &PoseLimits,
) -> Result<&'a FaceObservation, PoseRejection> {
    let face = match faces {
        [] => return Err(PoseRejection::NoFace),
        [face] => face,
        _ => return Err(PoseRejection::MultipleFaces(faces.len())),
    };
    if face.score < limits.min_score {
        return Err(PoseRejection::LowScore(face.score));
    }
    if face.yaw.abs() > limits.max_yaw
        || face.pitch.abs() > limits.max_pitch
        || face.roll.abs() > limits.max_roll
    {
        return Err(PoseRejection::OutOfRange {
            yaw: face.yaw,
            pitch: face.pitch,
            roll: face.roll,
        });
    }
    Ok(face)
}

#[derive(Debug)]
struct Pending {
    name: String,
    is_host: bool,
    feature: Option<Vec<f32>>,
}

#[derive(Default)]
struct LibraryState {
    records: Vec<FaceRecord>,
    pending: Option<Pending>,
    features: Arc<FaceFeatures>,
}

impl LibraryState {
    fn rebuild_features(&mut self) {
        self.features = Arc::new(
            self.records
                .iter()
                .map(|r| (r.name.clone(), r.feature.clone()))
                .collect(),
        );
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.records.iter().position(|r| r.name == name)
    }
}

#[derive(Default)]
pub struct FaceLibrary {
    path: Option<PathBuf>,
    state: Mutex<LibraryState>,
}

impl FaceLibrary {
    /// 内存人脸库 (不持久化)
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// 绑定文件路径, 调用 `reload` 前为空库
    pub fn at(path: Option<PathBuf>) -> Self {
        Self {
            path,
            state: Mutex::new(LibraryState::default()),
        }
    }

    /// 打开人脸库, 文件不存在时为空库
    pub fn open(path: Option<PathBuf>) -> Result<Self, LibraryError> {
        let library = Self::at(path);
        library.reload()?;
        Ok(library)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 识别用的特征快照
    pub fn features(&self) -> Arc<FaceFeatures> {
        lock(&self.state).features.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 从文件重新加载, 丢弃待确认缓存
    pub fn reload(&self) -> Result<usize, LibraryError> {
        let records = match &self.path {
            Some(path) if path.exists() => {
                let json = fs::read_to_string(path).map_err(|source| LibraryError::Io {
                    path: path.clone(),
                    source,
                })?;
                serde_json::from_str::<Vec<FaceRecord>>(&json).map_err(|source| {
                    LibraryError::Format {
                        path: path.clone(),
                        source,
                    }
                })?
            }
            _ => Vec::new(),
        };
        let mut state = lock(&self.state);
        state.records = records;
        state.pending = None;
        state.rebuild_features();
        info!("✅ 人脸库已加载: {} 人", state.records.len());
        Ok(state.records.len())
    }

    /// 开始录入: 记下身份, 等待采集特征
    pub fn begin_pending(&self, name: &str, is_host: bool) {
        lock(&self.state).pending = Some(Pending {
            name: name.to_string(),
            is_host,
            feature: None,
        });
    }

    /// 录入成功后缓存特征, 等待确认
    pub fn cache_candidate(&self, name: &str, feature: Vec<f32>) {
        let mut state = lock(&self.state);
        let is_host = match &state.pending {
            Some(pending) if pending.name == name => pending.is_host,
            _ => false,
        };
        state.pending = Some(Pending {
            name: name.to_string(),
            is_host,
            feature: Some(feature),
        });
    }

    /// 丢弃待确认缓存, 返回之前是否存在
    pub fn cancel_pending(&self) -> bool {
        lock(&self.state).pending.take().is_some()
    }

    pub fn has_candidate(&self) -> bool {
        lock(&self.state)
            .pending
            .as_ref()
            .is_some_and(|p| p.feature.is_some())
    }

    /// 确认最近一次录入的人脸并写入人脸库
    pub fn confirm(&self, name: &str, is_host: bool) -> Result<(), LibraryError> {
        {
            let mut state = lock(&self.state);
            let feature = match state.pending.as_ref() {
                Some(Pending {
                    feature: Some(feature),
                    ..
                }) => feature.clone(),
                _ => return Err(LibraryError::NoPending),
            };
            let host = is_host || state.pending.as_ref().is_some_and(|p| p.is_host);
            if let Some(pos) = state.position(name) {
                state.records.remove(pos);
            }
            state.records.push(FaceRecord {
                name: name.to_string(),
                is_host: host,
                feature,
            });
            state.pending = None;
            state.rebuild_features();
        }
        info!("✅ 人脸已确认: {}", name);
        self.persist()
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), LibraryError> {
        {
            let mut state = lock(&self.state);
            if state.position(to).is_some() {
                return Err(LibraryError::AlreadyExists(to.to_string()));
            }
            let pos = state
                .position(from)
                .ok_or_else(|| LibraryError::NotFound(from.to_string()))?;
            state.records[pos].name = to.to_string();
            state.rebuild_features();
        }
        info!("✏️  人脸改名: {} → {}", from, to);
        self.persist()
    }

    pub fn delete(&self, name: &str) -> Result<(), LibraryError> {
        {
            let mut state = lock(&self.state);
            let pos = state
                .position(name)
                .ok_or_else(|| LibraryError::NotFound(name.to_string()))?;
            state.records.remove(pos);
            state.rebuild_features();
        }
        info!("🗑️  人脸已删除: {}", name);
        self.persist()
    }

    pub fn list(&self) -> Vec<FaceEntry> {
        lock(&self.state)
            .records
            .iter()
            .map(|r| FaceEntry {
                name: r.name.clone(),
                is_host: r.is_host,
            })
            .collect()
    }

    /// 列表的 JSON 字符串 (控制面返回消息)
    pub fn list_message(&self) -> String {
        serde_json::to_string(&self.list()).unwrap_or_else(|e| {
            warn!("⚠️  人脸列表序列化失败: {}", e);
            String::from("[]")
        })
    }

    fn persist(&self) -> Result<(), LibraryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = {
            let state = lock(&self.state);
            serde_json::to_string_pretty(&state.records).map_err(|source| {
                LibraryError::Format {
                    path: path.clone(),
                    source,
                }
            })?
        };
        fs::write(path, json).map_err(|source| LibraryError::Io {
            path: path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Rect;

    fn observation(score: f32, yaw: f32) -> FaceObservation {
        FaceObservation {
            rect: Rect::new(0, 0, 10, 10),
            score,
            yaw,
            pitch: 0.0,
            roll: 0.0,
            feature: vec![1.0, 0.0],
        }
    }

    #[test]
    fn test_check_face_pose() {
        let limits = PoseLimits::default();
        assert_eq!(check_face_pose(&[], &limits), Err(PoseRejection::NoFace));
        assert_eq!(
            check_face_pose(&[observation(0.9, 0.0), observation(0.9, 0.0)], &limits),
            Err(PoseRejection::MultipleFaces(2))
        );
        assert_eq!(
            check_face_pose(&[observation(0.1, 0.0)], &limits),
            Err(PoseRejection::LowScore(0.1))
        );
        assert!(matches!(
            check_face_pose(&[observation(0.9, -45.0)], &limits),
            Err(PoseRejection::OutOfRange { .. })
        ));
        assert!(check_face_pose(&[observation(0.9, 5.0)], &limits).is_ok());
    }

    #[test]
    fn test_confirm_requires_candidate() {
        let library = FaceLibrary::in_memory();
        library.begin_pending("alice", true);
        assert!(matches!(
            library.confirm("alice", false),
            Err(LibraryError::NoPending)
        ));

        library.cache_candidate("alice", vec![0.5, 0.5]);
        library.confirm("alice", false).unwrap();
        assert_eq!(
            library.list(),
            vec![FaceEntry {
                name: "alice".into(),
                is_host: true
            }]
        );
        assert!(library.features().contains_key("alice"));
        assert!(!library.has_candidate());
    }

    #[test]
    fn test_rename_and_delete() {
        let library = FaceLibrary::in_memory();
        for name in ["a", "b"] {
            library.cache_candidate(name, vec![1.0]);
            library.confirm(name, false).unwrap();
        }
        assert!(matches!(
            library.rename("a", "b"),
            Err(LibraryError::AlreadyExists(_))
        ));
        library.rename("a", "c").unwrap();
        assert!(library.features().contains_key("c"));
        assert!(matches!(library.delete("a"), Err(LibraryError::NotFound(_))));
        library.delete("c").unwrap();
        assert_eq!(library.len(), 1);
        assert_eq!(library.list_message(), r#"[{"name":"b","is_host":false}]"#);
    }

    #[test]
    fn test_persist_and_reload() {
        let path = std::env::temp_dir().join(format!("face-library-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);

        let library = FaceLibrary::open(Some(path.clone())).unwrap();
        assert!(library.is_empty());
        library.cache_candidate("bob", vec![0.1, 0.2]);
        library.confirm("bob", true).unwrap();

        let reopened = FaceLibrary::open(Some(path.clone())).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(reopened.features().get("bob"), Some(&vec![0.1, 0.2]));
        assert!(reopened.list()[0].is_host);
    }
}
