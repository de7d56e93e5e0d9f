//! The two acquisition tasks the experiment supervisor runs exclusively of
//! each other (design §4.6, §4.7).

pub mod live_view;
pub mod multi_channel;
