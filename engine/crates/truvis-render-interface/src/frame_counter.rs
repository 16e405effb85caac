use crate::errors::ConfigurationError;

/// 帧计数器
///
/// frame id 一直累加，frame in flight 的 slot 为 `frame_id % fif_count`
pub struct FrameCounter {
    /// 当前的帧序号，一直累加
    frame_id: u64,
    fif_count: usize,
}
// new & init
impl FrameCounter {
    pub fn new(init_frame_id: u64, fif_count: usize) -> Result<Self, ConfigurationError> {
        if fif_count == 0 {
            return Err(ConfigurationError::InvalidConfig("frames_in_flight must be at least 1".to_string()));
        }
        Ok(Self {
            frame_id: init_frame_id,
            fif_count,
        })
    }
}
// update
impl FrameCounter {
    #[inline]
    pub fn next_frame(&mut self) {
        self.frame_id = self.frame_id.wrapping_add(1);
    }
}
// getters
impl FrameCounter {
    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }
    #[inline]
    pub fn fif_count(&self) -> usize {
        self.fif_count
    }
    /// 当前帧使用的 frame in flight slot
    #[inline]
    pub fn frame_slot(&self) -> usize {
        (self.frame_id % self.fif_count as u64) as usize
    }
    #[inline]
    pub fn frame_name(&self) -> String {
        format!("[F{}-{}]", self.frame_id, self.frame_slot())
    }
    /// 在 `frame_id` 提交的 GPU 工作，在当前帧是否一定已经结束
    #[inline]
    pub fn is_retired(&self, frame_id: u64) -> bool {
        frame_id + self.fif_count as u64 <= self.frame_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_slot_cycles() {
        let mut counter = FrameCounter::new(0, 3).unwrap();
        let slots = (0..7)
            .map(|_| {
                let slot = counter.frame_slot();
                counter.next_frame();
                slot
            })
            .collect::<Vec<_>>();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(counter.frame_name(), "[F7-1]");
    }

    #[test]
    fn test_is_retired() {
        let mut counter = FrameCounter::new(10, 2).unwrap();
        assert!(!counter.is_retired(9));
        counter.next_frame();
        assert!(counter.is_retired(9));
        assert!(!counter.is_retired(10));
        assert!(FrameCounter::new(0, 0).is_err());
    }
}
