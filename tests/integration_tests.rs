mod integration {
    mod app_tests;
    mod cancel_tests;
    mod config_tests;
    mod remote_tests;
    mod scan_tests;
}
