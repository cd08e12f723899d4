pub mod bandwidth_tracker;
pub mod choke_controller;
pub mod download_task;
pub mod peer;
pub mod peer_connection;
pub mod piece_scheduler;
pub mod torrent_manager;
