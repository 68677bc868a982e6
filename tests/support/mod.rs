pub mod mock_db;
