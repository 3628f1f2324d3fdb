pub mod taxprofile;
pub mod cleanup;
