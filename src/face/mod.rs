/// 人脸库与人脸录入
pub mod enrollment;
pub mod library;

pub use enrollment::{
    encode_png, run_enrollment, EnrollmentContext, EnrollmentSession, EnrollmentStatus, FaceResult,
};
pub use library::{
    check_face_pose, FaceEntry, FaceFeatures, FaceLibrary, FaceRecord, LibraryError, PoseRejection,
};
