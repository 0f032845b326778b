//! 视觉管理器 - 生命周期与控制面
//!
//! 状态机: Unconfigured → configure → Inactive → activate → Active
//!         Active → deactivate → Inactive → cleanup → Finalized
//!         任意状态 → shutdown → Finalized (Finalized 为终态)

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::Result as AnyResult;
use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{error, info, warn};

use crate::algorithms::{Algorithm, AlgorithmSet, Algorithms, EnabledAlgorithms, Shared};
use crate::config::VisionConfig;
use crate::detection::{ProcessingStatus, Rect};
use crate::error::{TrackingError, VisionError};
use crate::face::{
    run_enrollment, EnrollmentContext, EnrollmentSession, EnrollmentStatus, FaceEntry,
    FaceLibrary, FaceResult,
};
use crate::input::{FrameSource, IpcError, LatestFrameCell, SharedFrameSource};
use crate::pipeline::sync::lock;
use crate::pipeline::{
    spawn_pipeline, DetectionHistory, PipelineContext, Publisher, StatusCell, TaskGroup,
    VisionOutputs,
};
use crate::telemetry;
use crate::tracking::resolve_target;

/// 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unconfigured,
    Inactive,
    Active,
    Finalized,
}

/// 相机开关流
pub trait CameraControl: Send {
    fn set_stream(&mut self, on: bool) -> AnyResult<()>;
}

/// 外部依赖的提供方
pub trait Platform: Send {
    /// 建立取帧通道
    fn open_frame_source(
        &mut self,
        config: &VisionConfig,
    ) -> Result<Box<dyn FrameSource>, IpcError>;

    /// 加载六个算法
    fn load_algorithms(&mut self, config: &VisionConfig) -> AnyResult<Algorithms>;

    fn camera(&mut self) -> Shared<dyn CameraControl>;
}

/// 已选中的跟踪目标
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingTarget {
    /// ReID 从检测历史中匹配到的人体, 仅 ReID 启用时存在
    pub body: Option<Rect>,
    pub focus_seeded: bool,
}

// ========== 人脸控制面 ==========

pub const RESULT_OK: i32 = 0;
pub const RESULT_FAILED: i32 = 1;
pub const RESULT_INVALID_ARGS: i32 = -1;

/// 原始人脸请求 (命令码 + 参数)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceRequest {
    pub command: i32,
    pub username: String,
    pub oriname: String,
    pub is_host: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceResponse {
    pub result: i32,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaceCommand {
    Add { name: String, is_host: bool },
    CancelAdd,
    ConfirmLast { name: String, is_host: bool },
    Rename { from: String, to: String },
    Delete { name: String },
    ListAll,
}

impl FaceCommand {
    pub const ADD: i32 = 0;
    pub const CANCEL_ADD: i32 = 1;
    pub const CONFIRM_LAST: i32 = 2;
    pub const UPDATE_ID: i32 = 3;
    pub const DELETE: i32 = 4;
    pub const GET_ALL: i32 = 5;

    pub fn from_request(req: &FaceRequest) -> Result<Self, VisionError> {
        let require = |value: &str, what: &str| {
            if value.is_empty() {
                Err(VisionError::InvalidArgs(format!("missing {}", what)))
            } else {
                Ok(value.to_string())
            }
        };
        match req.command {
            Self::ADD => Ok(FaceCommand::Add {
                name: require(&req.username, "username")?,
                is_host: req.is_host,
            }),
            Self::CANCEL_ADD => Ok(FaceCommand::CancelAdd),
            Self::CONFIRM_LAST => Ok(FaceCommand::ConfirmLast {
                name: require(&req.username, "username")?,
                is_host: req.is_host,
            }),
            Self::UPDATE_ID => Ok(FaceCommand::Rename {
                from: require(&req.oriname, "original name")?,
                to: require(&req.username, "username")?,
            }),
            Self::DELETE => Ok(FaceCommand::Delete {
                name: require(&req.username, "username")?,
            }),
            Self::GET_ALL => Ok(FaceCommand::ListAll),
            other => Err(VisionError::InvalidArgs(format!(
                "unsupported face command {}",
                other
            ))),
        }
    }
}

// ========== 管理器 ==========

struct Resources {
    source: SharedFrameSource,
    algos: Algorithms,
    camera: Shared<dyn CameraControl>,
}

struct EnrollmentTask {
    session: Arc<EnrollmentSession>,
    handle: JoinHandle<()>,
}

pub struct VisionManager {
    config: VisionConfig,
    platform: Box<dyn Platform>,
    state: LifecycleState,
    ctx: PipelineContext,
    resources: Option<Resources>,
    group: Option<TaskGroup>,
    enrollment: Mutex<Option<EnrollmentTask>>,
}

impl VisionManager {
    pub fn new(config: VisionConfig, platform: Box<dyn Platform>) -> (Self, VisionOutputs) {
        let algorithms = Arc::new(AlgorithmSet::default());
        let status = Arc::new(StatusCell::default());
        let (publisher, outputs) =
            Publisher::new(config.output_capacity, status.clone(), algorithms.clone());
        let ctx = PipelineContext {
            cell: Arc::new(LatestFrameCell::new()),
            history: Arc::new(DetectionHistory::new(config.history_capacity)),
            algorithms,
            status,
            library: Arc::new(FaceLibrary::at(config.face_library_path.clone())),
            publisher,
        };
        let manager = Self {
            config,
            platform,
            state: LifecycleState::Unconfigured,
            ctx,
            resources: None,
            group: None,
            enrollment: Mutex::new(None),
        };
        (manager, outputs)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    pub fn status(&self) -> ProcessingStatus {
        self.ctx.status.get()
    }

    pub fn enabled(&self) -> EnabledAlgorithms {
        self.ctx.algorithms.snapshot()
    }

    pub fn library(&self) -> &Arc<FaceLibrary> {
        &self.ctx.library
    }

    pub fn history(&self) -> &Arc<DetectionHistory> {
        &self.ctx.history
    }

    fn expect_state(
        &self,
        action: &'static str,
        expected: LifecycleState,
    ) -> Result<(), VisionError> {
        if self.state != expected {
            return Err(VisionError::InvalidTransition {
                action,
                from: self.state,
            });
        }
        Ok(())
    }

    fn require_active(&self) -> Result<(), VisionError> {
        if self.state != LifecycleState::Active {
            return Err(VisionError::NotActive);
        }
        Ok(())
    }

    // ========== 生命周期 ==========

    /// 建立取帧通道, 加载算法和人脸库
    pub fn configure(&mut self) -> Result<(), VisionError> {
        self.expect_state("configure", LifecycleState::Unconfigured)?;
        info!("⚙️  配置视觉管理器");

        let source = self.platform.open_frame_source(&self.config).map_err(|e| {
            error!("❌ 取帧通道建立失败: {}", e);
            VisionError::Ipc(e)
        })?;
        let algos = self.platform.load_algorithms(&self.config).map_err(|e| {
            error!("❌ 算法加载失败: {:#}", e);
            VisionError::Backend(e)
        })?;
        self.ctx.library.reload()?;
        let camera = self.platform.camera();

        self.resources = Some(Resources {
            source: Arc::new(Mutex::new(source)),
            algos,
            camera,
        });
        self.state = LifecycleState::Inactive;
        info!("✅ 配置完成");
        Ok(())
    }

    /// 开启相机流并启动全部线程
    pub fn activate(&mut self) -> Result<(), VisionError> {
        self.expect_state("activate", LifecycleState::Inactive)?;
        info!("▶️  激活视觉管理器");
        self.call_camera(true)?;

        let Some(res) = &self.resources else {
            return Err(VisionError::InvalidTransition {
                action: "activate",
                from: self.state,
            });
        };
        match spawn_pipeline(
            &self.ctx,
            &res.algos,
            res.source.clone(),
            self.config.ingest_poll(),
        ) {
            Ok(group) => {
                self.group = Some(group);
                self.state = LifecycleState::Active;
                info!("✅ 已激活");
                Ok(())
            }
            Err(e) => {
                error!("❌ 线程启动失败: {}", e);
                if let Err(stop) = self.call_camera(false) {
                    warn!("⚠️  回滚相机流失败: {}", stop);
                }
                Err(e)
            }
        }
    }

    /// 关闭相机流, 唤醒并回收全部线程, 重置跟踪并关闭所有算法
    pub fn deactivate(&mut self) -> Result<(), VisionError> {
        self.expect_state("deactivate", LifecycleState::Active)?;
        info!("⏸️  停用视觉管理器");
        self.call_camera(false)?;
        self.teardown();
        self.state = LifecycleState::Inactive;
        info!("✅ 已停用");
        Ok(())
    }

    /// 释放取帧通道与算法, 之后只允许 shutdown
    pub fn cleanup(&mut self) -> Result<(), VisionError> {
        self.expect_state("cleanup", LifecycleState::Inactive)?;
        self.resources = None;
        self.state = LifecycleState::Finalized;
        info!("🧹 资源已释放");
        Ok(())
    }

    /// 任意状态下结束; 激活中则先尽力停用
    pub fn shutdown(&mut self) {
        if self.state == LifecycleState::Finalized {
            return;
        }
        if self.state == LifecycleState::Active {
            if let Err(e) = self.call_camera(false) {
                warn!("⚠️  关闭相机流失败: {}", e);
            }
            self.teardown();
        }
        self.resources = None;
        self.state = LifecycleState::Finalized;
        info!("👋 视觉管理器已结束");
    }

    fn teardown(&mut self) {
        self.stop_enrollment();
        if let Some(group) = self.group.take() {
            group.shutdown();
        }
        if let Some(res) = &self.resources {
            lock(&res.algos.focus).reset();
            lock(&res.algos.reid).reset();
        }
        self.ctx.algorithms.clear();
        self.ctx.history.clear();
        self.ctx.status.set(ProcessingStatus::Selecting);
    }

    /// 在辅助线程中调用相机, 超时视为失败
    fn call_camera(&self, on: bool) -> Result<(), VisionError> {
        let action = if on { "start" } else { "stop" };
        let Some(res) = &self.resources else {
            return Err(VisionError::Camera {
                action,
                reason: "not configured".into(),
            });
        };
        let camera = res.camera.clone();
        let (tx, rx) = bounded(1);
        telemetry::spawn_thread("camera-call", move || {
            let _ = tx.send(lock(&camera).set_stream(on));
        })
        .map_err(|source| VisionError::Spawn {
            name: "camera-call".into(),
            source,
        })?;

        let timeout = self.config.camera_timeout();
        match rx.recv_timeout(timeout) {
            Ok(Ok(())) => {
                info!("📷 相机流 {} 成功", action);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("❌ 相机流 {} 失败: {:#}", action, e);
                Err(VisionError::Camera {
                    action,
                    reason: format!("{:#}", e),
                })
            }
            Err(RecvTimeoutError::Timeout) => {
                error!("❌ 相机流 {} 超时", action);
                Err(VisionError::CameraTimeout { action, timeout })
            }
            Err(RecvTimeoutError::Disconnected) => Err(VisionError::Camera {
                action,
                reason: "camera call aborted".into(),
            }),
        }
    }

    // ========== 算法开关 ==========

    pub fn set_algorithms(
        &self,
        enable: &[Algorithm],
        disable: &[Algorithm],
    ) -> Result<(), VisionError> {
        self.require_active()?;
        for algo in disable {
            if self.ctx.algorithms.set(*algo, false) {
                info!("⏹️  关闭算法 {}", algo);
            }
        }
        for algo in enable {
            if self.ctx.algorithms.set(*algo, true) {
                continue;
            }
            info!("▶️  开启算法 {}", algo);
            if *algo == Algorithm::Face {
                if let Err(e) = self.ctx.library.reload() {
                    warn!("⚠️  人脸库重新加载失败: {}", e);
                }
            }
        }
        Ok(())
    }

    /// 按编码开关算法; 任一编码非法时整体拒绝
    pub fn handle_algo_request(&self, enable: &[i32], disable: &[i32]) -> Result<(), VisionError> {
        let decode = |codes: &[i32]| -> Result<Vec<Algorithm>, VisionError> {
            codes
                .iter()
                .map(|&code| {
                    Algorithm::from_code(code).ok_or_else(|| {
                        VisionError::InvalidArgs(format!("unknown algorithm code {}", code))
                    })
                })
                .collect()
        };
        let enable = decode(enable)?;
        let disable = decode(disable)?;
        self.set_algorithms(&enable, &disable)
    }

    // ========== 跟踪目标 ==========

    /// 设置跟踪目标: ReID 从历史中匹配人体, Focus 直接以区域初始化
    pub fn set_tracking_target(&self, roi: Rect) -> Result<TrackingTarget, VisionError> {
        self.require_active()?;
        let Some(res) = &self.resources else {
            return Err(VisionError::NotActive);
        };
        let enabled = self.ctx.algorithms.snapshot();
        let reid_on = enabled.contains(Algorithm::Reid);
        let focus_on = enabled.contains(Algorithm::Focus);
        if !reid_on && !focus_on {
            return Err(TrackingError::NoTracker.into());
        }

        let resolved = if reid_on {
            let entries = self.ctx.history.snapshot();
            let target = resolve_target(&entries, &roi, self.config.match_iou_threshold)
                .ok_or(TrackingError::NoMatch)?;
            Some(target)
        } else {
            None
        };
        let latest = if focus_on {
            Some(self.ctx.cell.latest().ok_or(TrackingError::NoFrame)?.1)
        } else {
            None
        };

        if let Some(target) = &resolved {
            info!(
                "🎯 ReID 目标: cycle {}, {:?}, IOU {:.2}",
                target.cycle, target.rect, target.iou
            );
            seed("reid", lock(&res.algos.reid).set_tracker(&target.frame.image, target.rect))?;
        }
        if let Some(frame) = &latest {
            let seeded = seed("focus", lock(&res.algos.focus).set_tracker(&frame.image, roi));
            if let Err(e) = seeded {
                // 已初始化的 ReID 一并回退
                if resolved.is_some() {
                    lock(&res.algos.reid).reset();
                }
                return Err(e.into());
            }
        }

        self.ctx.status.set(ProcessingStatus::Tracking);
        info!("🎯 跟踪状态: TRACKING");
        Ok(TrackingTarget {
            body: resolved.map(|t| t.rect),
            focus_seeded: latest.is_some(),
        })
    }

    // ========== 人脸 ==========

    pub fn handle_face_request(&self, req: &FaceRequest) -> FaceResponse {
        info!(
            "👤 人脸请求: command {}, username '{}'",
            req.command, req.username
        );
        let outcome = FaceCommand::from_request(req).and_then(|cmd| self.face_command(cmd));
        match outcome {
            Ok(msg) => FaceResponse {
                result: RESULT_OK,
                msg,
            },
            Err(VisionError::InvalidArgs(msg)) => {
                warn!("⚠️  人脸请求参数错误: {}", msg);
                if req.command == FaceCommand::ADD {
                    self.ctx.publisher.publish_face_result(FaceResult::new(
                        EnrollmentStatus::InvalidArgs,
                        &req.username,
                        msg.clone(),
                    ));
                }
                FaceResponse {
                    result: RESULT_INVALID_ARGS,
                    msg,
                }
            }
            Err(e) => FaceResponse {
                result: RESULT_FAILED,
                msg: e.to_string(),
            },
        }
    }

    /// 执行人脸命令, 返回消息 (仅列表命令非空)
    pub fn face_command(&self, cmd: FaceCommand) -> Result<String, VisionError> {
        match cmd {
            FaceCommand::Add { name, is_host } => {
                self.add_face(&name, is_host)?;
                Ok(String::new())
            }
            FaceCommand::CancelAdd => {
                self.stop_enrollment();
                self.ctx.library.cancel_pending();
                Ok(String::new())
            }
            FaceCommand::ConfirmLast { name, is_host } => {
                self.ctx.library.confirm(&name, is_host)?;
                Ok(String::new())
            }
            FaceCommand::Rename { from, to } => {
                self.ctx.library.rename(&from, &to)?;
                Ok(String::new())
            }
            FaceCommand::Delete { name } => {
                self.ctx.library.delete(&name)?;
                Ok(String::new())
            }
            FaceCommand::ListAll => Ok(self.ctx.library.list_message()),
        }
    }

    pub fn list_faces(&self) -> Vec<FaceEntry> {
        self.ctx.library.list()
    }

    /// 启动录入任务; 已有任务时先取消
    pub fn add_face(&self, name: &str, is_host: bool) -> Result<(), VisionError> {
        if name.is_empty() {
            return Err(VisionError::InvalidArgs("missing username".into()));
        }
        self.require_active()?;
        let (Some(res), Some(group)) = (&self.resources, &self.group) else {
            return Err(VisionError::NotActive);
        };
        self.stop_enrollment();

        self.ctx.library.begin_pending(name, is_host);
        let session = Arc::new(EnrollmentSession::new(
            name,
            self.config.enroll_timeout(),
            group.token(),
        ));
        let ctx = EnrollmentContext {
            cell: self.ctx.cell.clone(),
            recognizer: res.algos.face.clone(),
            library: self.ctx.library.clone(),
            publisher: self.ctx.publisher.clone(),
            pose: self.config.pose.clone(),
            duplicate_threshold: self.config.duplicate_threshold,
        };
        let task_session = session.clone();
        let handle = telemetry::spawn_thread("face-enroll", move || {
            run_enrollment(&task_session, &ctx)
        })
        .map_err(|source| VisionError::Spawn {
            name: "face-enroll".into(),
            source,
        })?;
        *lock(&self.enrollment) = Some(EnrollmentTask { session, handle });
        Ok(())
    }

    /// 取消并回收录入任务, 未结束的会话发布 CANCELLED
    fn stop_enrollment(&self) {
        let task = lock(&self.enrollment).take();
        if let Some(task) = task {
            task.session.cancel(&self.ctx.publisher);
            if task.handle.join().is_err() {
                error!("❌ 录入线程 panic 退出");
            }
        }
    }
}

fn seed(tracker: &'static str, outcome: AnyResult<bool>) -> Result<(), TrackingError> {
    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => Err(TrackingError::Tracker {
            tracker,
            reason: "target rejected".into(),
        }),
        Err(e) => Err(TrackingError::Tracker {
            tracker,
            reason: format!("{:#}", e),
        }),
    }
}

impl Drop for VisionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
