// CSM Tests
//
// This is a meta-package that organizes the end-to-end test structure.
// It doesn't contain library code; the scenarios live under e2e/.
