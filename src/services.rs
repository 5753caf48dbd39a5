pub mod aws_service;
pub mod openid_service;
