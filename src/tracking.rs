//! 跟踪目标匹配
//!
//! 客户端给出的区域 → 检测历史中的具体人体

use std::sync::Arc;

use crate::detection::Rect;
use crate::input::Frame;
use crate::pipeline::DetectionEntry;

/// 匹配结果
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub cycle: u64,
    pub frame: Arc<Frame>,
    pub rect: Rect,
    pub iou: f64,
}

/// 从新到旧扫描历史, 第一个存在 IOU 大于阈值的条目胜出,
/// 取该条目中 IOU 最大的人体 (并列取先出现者)
///
/// `entries` 按从旧到新排列.
pub fn resolve_target(
    entries: &[Arc<DetectionEntry>],
    roi: &Rect,
    threshold: f64,
) -> Option<ResolvedTarget> {
    entries.iter().rev().find_map(|entry| {
        let (rect, iou) = entry
            .bodies
            .iter()
            .map(|body| (body.rect, body.rect.iou(roi)))
            .fold(None, |best: Option<(Rect, f64)>, (rect, iou)| match best {
                Some((_, best_iou)) if best_iou >= iou => best,
                _ => Some((rect, iou)),
            })?;
        (iou > threshold).then(|| ResolvedTarget {
            cycle: entry.cycle,
            frame: entry.frame.clone(),
            rect,
            iou,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BodyBox;
    use crate::input::Timestamp;
    use image::RgbImage;

    fn entry(cycle: u64, rects: &[Rect]) -> Arc<DetectionEntry> {
        Arc::new(DetectionEntry {
            cycle,
            frame: Arc::new(Frame::new(RgbImage::new(2, 2), Timestamp(cycle))),
            bodies: rects
                .iter()
                .map(|&rect| BodyBox { rect, score: 0.9 })
                .collect(),
            publish_in_stage2: false,
        })
    }

    #[test]
    fn test_prefers_most_recent_entry() {
        let roi = Rect::new(0, 0, 100, 100);
        let entries = vec![
            entry(1, &[Rect::new(0, 0, 100, 100)]), // IOU 1.0
            entry(2, &[Rect::new(0, 0, 80, 100)]),  // IOU 0.8
        ];
        let target = resolve_target(&entries, &roi, 0.5).unwrap();
        assert_eq!(target.cycle, 2);
        assert_eq!(target.rect, Rect::new(0, 0, 80, 100));
    }

    #[test]
    fn test_best_iou_within_entry() {
        let roi = Rect::new(0, 0, 100, 100);
        let entries = vec![entry(
            1,
            &[
                Rect::new(0, 0, 60, 100),
                Rect::new(0, 0, 90, 100),
                Rect::new(500, 500, 10, 10),
            ],
        )];
        let target = resolve_target(&entries, &roi, 0.5).unwrap();
        assert_eq!(target.rect, Rect::new(0, 0, 90, 100));
        assert!((target.iou - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_skips_entries_below_threshold() {
        let roi = Rect::new(0, 0, 100, 100);
        let entries = vec![
            entry(1, &[Rect::new(0, 0, 70, 100)]),
            entry(2, &[Rect::new(0, 0, 40, 100)]), // IOU 0.4
            entry(3, &[]),
        ];
        let target = resolve_target(&entries, &roi, 0.5).unwrap();
        assert_eq!(target.cycle, 1);
    }

    #[test]
    fn test_exact_threshold_is_not_a_match() {
        let roi = Rect::new(0, 0, 100, 100);
        let entries = vec![entry(1, &[Rect::new(0, 0, 50, 100)])];
        assert!(resolve_target(&entries, &roi, 0.5).is_none());
    }

    #[test]
    fn test_empty_history() {
        assert!(resolve_target(&[], &Rect::new(0, 0, 1, 1), 0.5).is_none());
    }
}
