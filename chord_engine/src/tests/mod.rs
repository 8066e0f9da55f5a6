mod accumulate_tests;
mod buffer_tests;
mod codec_tests;
mod processor_tests;
mod stage_tests;
mod task_tests;
mod utils;
