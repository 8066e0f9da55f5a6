//! Fixed-capacity voice slot management.
//!
//! Maps trigger events to voice indices, sample-accurate within a block.
//! When every slot is busy, the oldest active voice is recycled. The active
//! list stays sorted by trigger age with the oldest voice first; ages are
//! implicit from list position.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ActivatedVoice {
    pub voice_index: usize,
    /// The trigger's sample offset within the block.
    pub sample_index: usize,
}

pub struct VoiceAllocator {
    inactive_voice_indices: Vec<usize>,
    active_voice_indices: Vec<usize>,
    deactivated_voice_indices: Vec<usize>,
    activated_voices: Vec<ActivatedVoice>,
}

impl VoiceAllocator {
    pub fn new(max_voice_count: usize) -> Self {
        // Fill the free stack in reverse so voice 0 pops off first
        let inactive_voice_indices = (0..max_voice_count).rev().collect();
        Self {
            inactive_voice_indices,
            active_voice_indices: Vec::with_capacity(max_voice_count),
            deactivated_voice_indices: Vec::with_capacity(max_voice_count),
            activated_voices: Vec::with_capacity(max_voice_count),
        }
    }

    /// Clears the per-block activation and deactivation lists.
    pub fn begin_block_voice_allocation(&mut self) {
        self.deactivated_voice_indices.clear();
        self.activated_voices.clear();
    }

    pub fn trigger_voice(&mut self, sample_index: usize) {
        if self.inactive_voice_indices.is_empty() {
            // No free slots; recycle the oldest active voice
            assert!(!self.active_voice_indices.is_empty());
            let deactivated_voice_index = self.active_voice_indices.remove(0);

            // If this voice was activated earlier this block, drop that
            // pending activation; a voice never activates and then
            // deactivates within one block
            if let Some(position) = self
                .activated_voices
                .iter()
                .position(|activated| activated.voice_index == deactivated_voice_index)
            {
                self.activated_voices.remove(position);
            }

            self.inactive_voice_indices.push(deactivated_voice_index);

            // It's possible, though unlikely, that this voice was already
            // deactivated and reactivated this block and is now being
            // deactivated a second time; don't list it twice
            if !self
                .deactivated_voice_indices
                .contains(&deactivated_voice_index)
            {
                self.deactivated_voice_indices.push(deactivated_voice_index);
            }
        }

        let voice_index = self
            .inactive_voice_indices
            .pop()
            .expect("an inactive voice is available");

        // Appending keeps both lists sorted by voice age, oldest first
        self.active_voice_indices.push(voice_index);
        self.activated_voices.push(ActivatedVoice {
            voice_index,
            sample_index,
        });
    }

    pub fn deactivate_voice(&mut self, voice_index: usize) {
        let position = self
            .active_voice_indices
            .iter()
            .position(|&active| active == voice_index)
            .expect("the voice is active");
        self.active_voice_indices.remove(position);
        self.inactive_voice_indices.push(voice_index);
    }

    pub fn active_voice_indices(&self) -> &[usize] {
        &self.active_voice_indices
    }

    pub fn activated_voices(&self) -> &[ActivatedVoice] {
        &self.activated_voices
    }

    pub fn deactivated_voice_indices(&self) -> &[usize] {
        &self.deactivated_voice_indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voices_allocate_in_index_order() {
        let mut allocator = VoiceAllocator::new(3);
        allocator.begin_block_voice_allocation();
        allocator.trigger_voice(0);
        allocator.trigger_voice(4);
        assert_eq!(allocator.active_voice_indices(), &[0, 1]);
        assert_eq!(
            allocator.activated_voices(),
            &[
                ActivatedVoice {
                    voice_index: 0,
                    sample_index: 0
                },
                ActivatedVoice {
                    voice_index: 1,
                    sample_index: 4
                },
            ]
        );
        assert!(allocator.deactivated_voice_indices().is_empty());
    }

    #[test]
    fn oldest_voice_is_recycled_when_full() {
        let mut allocator = VoiceAllocator::new(2);
        allocator.begin_block_voice_allocation();
        allocator.trigger_voice(10);
        allocator.trigger_voice(20);
        allocator.trigger_voice(5);

        // Voice 0 (oldest) was stolen: it appears once in both per-block
        // lists, and its pending activation at sample 10 was replaced
        assert_eq!(allocator.deactivated_voice_indices(), &[0]);
        assert_eq!(
            allocator.activated_voices(),
            &[
                ActivatedVoice {
                    voice_index: 1,
                    sample_index: 20
                },
                ActivatedVoice {
                    voice_index: 0,
                    sample_index: 5
                },
            ]
        );
        // Voice 1 is now the oldest
        assert_eq!(allocator.active_voice_indices(), &[1, 0]);
    }

    #[test]
    fn deactivation_frees_the_slot() {
        let mut allocator = VoiceAllocator::new(2);
        allocator.begin_block_voice_allocation();
        allocator.trigger_voice(0);
        allocator.trigger_voice(0);
        allocator.deactivate_voice(0);
        assert_eq!(allocator.active_voice_indices(), &[1]);

        allocator.begin_block_voice_allocation();
        allocator.trigger_voice(7);
        assert_eq!(allocator.active_voice_indices(), &[1, 0]);
        assert_eq!(
            allocator.activated_voices(),
            &[ActivatedVoice {
                voice_index: 0,
                sample_index: 7
            }]
        );
    }

    #[test]
    fn steal_then_retrigger_lists_each_voice_once() {
        let mut allocator = VoiceAllocator::new(1);
        allocator.begin_block_voice_allocation();
        allocator.trigger_voice(0);
        allocator.trigger_voice(3);
        allocator.trigger_voice(9);

        assert_eq!(allocator.deactivated_voice_indices(), &[0]);
        assert_eq!(
            allocator.activated_voices(),
            &[ActivatedVoice {
                voice_index: 0,
                sample_index: 9
            }]
        );
        assert_eq!(allocator.active_voice_indices(), &[0]);
    }
}
