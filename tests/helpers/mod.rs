#![allow(dead_code)]

pub mod builders;
pub mod db;

pub use builders::{
    pkce_pair, test_token_service, test_token_service_with, RecordingEmailSender, SentMail,
    SubjectBuilder, TestKeys,
};
pub use db::TestDb;
