mod common;
mod peer_manager_tests;
