mod identity_test;
mod load_table_test;
mod management_test;
