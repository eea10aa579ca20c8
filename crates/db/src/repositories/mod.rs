pub mod job_repo;
